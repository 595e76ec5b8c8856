//! CRM deal payloads and their mapping onto local lead fields.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use dealsync_core::{Field, FullInfo, LeadFields, MaskedInfo, Provenance};
use dealsync_storage::{CrmClient, CrmError};
use scraper::Html;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("unrecognized deal payload: {0}")]
    UnrecognizedPayload(String),
    #[error("person lookup for {person_id} failed: {source}")]
    PersonLookup {
        person_id: i64,
        #[source]
        source: CrmError,
    },
    #[error("invalid service rules: {0}")]
    InvalidRules(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactPoint {
    pub value: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default, alias = "emails", deserialize_with = "contact_points")]
    pub email: Vec<ContactPoint>,
    #[serde(default, alias = "phones", deserialize_with = "contact_points")]
    pub phone: Vec<ContactPoint>,
}

/// Person summary the CRM sometimes inlines under `person_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedPerson {
    pub value: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "contact_points")]
    pub email: Vec<ContactPoint>,
    #[serde(default, deserialize_with = "contact_points")]
    pub phone: Vec<ContactPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PersonRef {
    Id(i64),
    Embedded(EmbeddedPerson),
}

impl PersonRef {
    pub fn id(&self) -> i64 {
        match self {
            Self::Id(id) => *id,
            Self::Embedded(p) => p.value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub add_time: Option<String>,
    #[serde(default)]
    pub update_time: Option<String>,
    #[serde(default)]
    pub pipeline_id: Option<i64>,
    #[serde(default)]
    pub stage_id: Option<i64>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub person_id: Option<PersonRef>,
    #[serde(default)]
    pub person: Option<Person>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Deal {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.add_time.as_deref().and_then(parse_crm_timestamp)
    }

    /// Looks up a custom field at the top level, then under `custom_fields`.
    pub fn custom_value(&self, key: &str) -> Option<&JsonValue> {
        let raw = self.extra.get(key).or_else(|| {
            self.extra
                .get("custom_fields")
                .and_then(|c| c.get(key))
        })?;
        let value = match raw {
            JsonValue::Object(obj) => obj.get("value").unwrap_or(raw),
            _ => raw,
        };
        (!value.is_null()).then_some(value)
    }

    pub fn custom_text(&self, key: &str) -> Option<String> {
        match self.custom_value(key)? {
            JsonValue::String(s) => text_or_none(s),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

fn id_as_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match JsonValue::deserialize(deserializer)? {
        JsonValue::Number(n) => Ok(n.to_string()),
        JsonValue::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        other => Err(de::Error::custom(format!("invalid deal id: {other}"))),
    }
}

fn contact_points<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<ContactPoint>, D::Error> {
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                JsonValue::String(value) => text_or_none(&value).map(|value| ContactPoint {
                    value,
                    primary: false,
                    label: None,
                }),
                other => serde_json::from_value::<ContactPoint>(other)
                    .ok()
                    .filter(|c| !c.value.trim().is_empty()),
            })
            .collect(),
        JsonValue::String(value) => text_or_none(&value)
            .map(|value| ContactPoint {
                value,
                primary: true,
                label: None,
            })
            .into_iter()
            .collect(),
        _ => Vec::new(),
    })
}

/// Accepts `{current: deal}`, `{data: deal}`, or a bare deal carrying `id` and `title`.
pub fn extract_deal(payload: &JsonValue) -> Result<Deal, TransformError> {
    let candidate = ["current", "data"]
        .iter()
        .find_map(|key| payload.get(key).filter(|v| v.is_object()))
        .or_else(|| {
            (payload.get("id").is_some() && payload.get("title").is_some()).then_some(payload)
        })
        .ok_or_else(|| {
            TransformError::UnrecognizedPayload(
                "no deal under `current`, `data`, or the payload root".to_string(),
            )
        })?;
    serde_json::from_value(candidate.clone())
        .map_err(|err| TransformError::UnrecognizedPayload(format!("deal did not parse: {err}")))
}

/// Accepts RFC 3339 and the CRM's `YYYY-MM-DD HH:MM:SS` UTC form.
pub fn parse_crm_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%m/%d/%Y"))
        .ok()
        .or_else(|| parse_crm_timestamp(raw).map(|ts| ts.date_naive()))
}

/// Custom field keys carrying structured lead data.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldKeys {
    pub wedding_date: String,
    pub city: String,
    pub state: String,
    pub budget: String,
    pub description: String,
    pub comments: String,
}

impl Default for FieldKeys {
    fn default() -> Self {
        Self {
            wedding_date: "wedding_date".to_string(),
            city: "city".to_string(),
            state: "state".to_string(),
            budget: "budget".to_string(),
            description: "description".to_string(),
            comments: "comments".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceRule {
    pub tag: String,
    pub contains_any: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceRules {
    pub default_tag: String,
    pub rules: Vec<ServiceRule>,
}

/// Outcome of service classification; `Defaulted` means no keyword matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "tags", rename_all = "snake_case")]
pub enum ServiceMatch {
    Matched(Vec<String>),
    Defaulted(String),
}

impl ServiceMatch {
    pub fn tags(&self) -> Vec<String> {
        match self {
            Self::Matched(tags) => tags.clone(),
            Self::Defaulted(tag) => vec![tag.clone()],
        }
    }

    pub fn is_defaulted(&self) -> bool {
        matches!(self, Self::Defaulted(_))
    }
}

fn rule(tag: &str, keywords: &[&str]) -> ServiceRule {
    ServiceRule {
        tag: tag.to_string(),
        contains_any: keywords.iter().map(|k| k.to_string()).collect(),
    }
}

impl Default for ServiceRules {
    fn default() -> Self {
        Self {
            default_tag: "PHOTOGRAPHY".to_string(),
            rules: vec![
                rule("PHOTOGRAPHY", &["photo", "picture", "portrait"]),
                rule("VIDEOGRAPHY", &["video", "film", "cinemat"]),
                rule("DRONE", &["drone", "aerial"]),
                rule(
                    "MULTI_DAY",
                    &["multi-day", "multi day", "multiday", "multiple days", "two day", "2 day", "2-day", "weekend"],
                ),
                rule("RAW_FOOTAGE", &["raw"]),
            ],
        }
    }
}

impl ServiceRules {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, TransformError> {
        let rules: ServiceRules =
            serde_yaml::from_str(yaml).map_err(|err| TransformError::InvalidRules(err.to_string()))?;
        if rules.default_tag.trim().is_empty() {
            return Err(TransformError::InvalidRules("default_tag must not be empty".into()));
        }
        Ok(rules)
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn classify(&self, text: &str) -> ServiceMatch {
        let haystack = text.to_lowercase();
        let mut tags: Vec<String> = Vec::new();
        for rule in &self.rules {
            let hit = rule
                .contains_any
                .iter()
                .any(|needle| contains_at_word_start(&haystack, &needle.to_lowercase()));
            if hit && !tags.contains(&rule.tag) {
                tags.push(rule.tag.clone());
            }
        }
        if tags.is_empty() {
            ServiceMatch::Defaulted(self.default_tag.clone())
        } else {
            ServiceMatch::Matched(tags)
        }
    }
}

fn contains_at_word_start(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    haystack.match_indices(needle).any(|(idx, _)| {
        haystack[..idx]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric())
    })
}

const STATES: &[(&str, &str)] = &[
    ("AL", "Alabama"), ("AK", "Alaska"), ("AZ", "Arizona"), ("AR", "Arkansas"),
    ("CA", "California"), ("CO", "Colorado"), ("CT", "Connecticut"), ("DE", "Delaware"),
    ("DC", "District of Columbia"), ("FL", "Florida"), ("GA", "Georgia"), ("HI", "Hawaii"),
    ("ID", "Idaho"), ("IL", "Illinois"), ("IN", "Indiana"), ("IA", "Iowa"),
    ("KS", "Kansas"), ("KY", "Kentucky"), ("LA", "Louisiana"), ("ME", "Maine"),
    ("MD", "Maryland"), ("MA", "Massachusetts"), ("MI", "Michigan"), ("MN", "Minnesota"),
    ("MS", "Mississippi"), ("MO", "Missouri"), ("MT", "Montana"), ("NE", "Nebraska"),
    ("NV", "Nevada"), ("NH", "New Hampshire"), ("NJ", "New Jersey"), ("NM", "New Mexico"),
    ("NY", "New York"), ("NC", "North Carolina"), ("ND", "North Dakota"), ("OH", "Ohio"),
    ("OK", "Oklahoma"), ("OR", "Oregon"), ("PA", "Pennsylvania"), ("RI", "Rhode Island"),
    ("SC", "South Carolina"), ("SD", "South Dakota"), ("TN", "Tennessee"), ("TX", "Texas"),
    ("UT", "Utah"), ("VT", "Vermont"), ("VA", "Virginia"), ("WA", "Washington"),
    ("WV", "West Virginia"), ("WI", "Wisconsin"), ("WY", "Wyoming"),
];

const LOCATION_PLACEHOLDERS: &[&str] = &[
    "", "-", "--", "?", "n/a", "na", "none", "null", "tbd", "tba", "unknown", "not sure", "location",
];

pub fn is_placeholder_location(value: &str) -> bool {
    let normalized = value.trim().trim_end_matches('.').to_ascii_lowercase();
    LOCATION_PLACEHOLDERS.contains(&normalized.as_str())
}

/// Resolves an abbreviation or a (possibly misspelled) state name to its abbreviation.
pub fn normalize_state(raw: &str) -> Option<&'static str> {
    let candidate = raw.trim().trim_end_matches('.');
    if candidate.len() == 2 {
        let upper = candidate.to_ascii_uppercase();
        return STATES.iter().find(|(abbr, _)| *abbr == upper).map(|(abbr, _)| *abbr);
    }
    let lowered = candidate.to_lowercase();
    if let Some((abbr, _)) = STATES.iter().find(|(_, name)| name.to_lowercase() == lowered) {
        return Some(*abbr);
    }
    if lowered.len() < 5 {
        return None;
    }
    STATES
        .iter()
        .map(|(abbr, name)| (abbr, jaro_winkler(&lowered, &name.to_lowercase())))
        .filter(|(_, score)| *score >= 0.93)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(abbr, _)| *abbr)
}

/// Two-letter segments must already be upper case so words like "or" and "me" stay words.
fn state_from_title(title: &str) -> Option<(&'static str, String)> {
    title
        .split(['-', '|', '/', ',', '(', ')', ':'])
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .find_map(|segment| {
            if segment.len() == 2 && segment != segment.to_ascii_uppercase() {
                return None;
            }
            normalize_state(segment).map(|abbr| (abbr, segment.to_string()))
        })
}

/// City (and state, when present) from a `Venue Location:` line.
fn venue_location(comments: &str) -> Option<(String, Option<&'static str>, String)> {
    const MARKER: &str = "venue location:";
    comments.lines().find_map(|line| {
        let idx = line.to_ascii_lowercase().find(MARKER)?;
        let rest = line[idx + MARKER.len()..].trim();
        if rest.is_empty() {
            return None;
        }
        let parts = rest
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>();
        let (city, state) = match parts.as_slice() {
            [] => return None,
            [only] => match only.rsplit_once(' ') {
                Some((city, tail)) if tail.len() == 2 => match normalize_state(tail) {
                    Some(abbr) => (city.trim().to_string(), Some(abbr)),
                    None => (only.to_string(), None),
                },
                _ => (only.to_string(), None),
            },
            [.., city, last] => match normalize_state(last) {
                Some(abbr) => (city.to_string(), Some(abbr)),
                None => (parts[0].to_string(), None),
            },
        };
        Some((city, state, line.trim().to_string()))
    })
}

fn normalize_city(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if is_placeholder_location(&collapsed) {
        return None;
    }
    let uniform_case = collapsed == collapsed.to_lowercase() || collapsed == collapsed.to_uppercase();
    if !uniform_case {
        return Some(collapsed);
    }
    Some(
        collapsed
            .split(' ')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                    None => String::new(),
                }
            })
            .collect::<Vec<String>>()
            .join(" "),
    )
}

const BLOCK_BREAKS: &[&str] = &[
    "<br>", "<br/>", "<br />", "<BR>", "<BR/>", "<BR />", "</p>", "</P>", "</div>", "</DIV>", "</li>", "</LI>",
];

/// Reduces CRM note HTML to plain text, one line per block.
pub fn html_to_text(input: &str) -> String {
    if !input.contains('<') {
        return input.to_string();
    }
    let with_breaks = BLOCK_BREAKS
        .iter()
        .fold(input.to_string(), |acc, tag| acc.replace(tag, "\n"));
    let fragment = Html::parse_fragment(&with_breaks);
    fragment.root_element().text().collect::<String>()
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() || (ch == '.' && !current.is_empty()) {
            current.push(ch);
        } else if ch == ',' && !current.is_empty() {
            continue;
        } else if !current.is_empty() {
            if let Ok(value) = current.trim_end_matches('.').parse::<f64>() {
                out.push(value);
            }
            current.clear();
        }
    }
    if let Ok(value) = current.trim_end_matches('.').parse::<f64>() {
        out.push(value);
    }
    out
}

fn budget_from(deal: &Deal, key: &str) -> Field<f64> {
    let structured = match deal.custom_value(key) {
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(JsonValue::String(s)) => extract_numbers(s).into_iter().next(),
        _ => None,
    };
    if let Some(budget) = structured.filter(|b| *b > 0.0) {
        return Field::with_value(budget, Provenance::StructuredField { key: key.to_string() });
    }
    match deal.value.filter(|v| *v > 0.0) {
        Some(value) => Field::with_value(value, Provenance::StructuredField { key: "value".into() }),
        None => Field::empty(),
    }
}

fn primary_contact(points: &[ContactPoint]) -> Option<String> {
    points
        .iter()
        .find(|p| p.primary)
        .or_else(|| points.first())
        .and_then(|p| text_or_none(&p.value))
}

fn person_name(person: &Person) -> Option<String> {
    person.name.as_deref().and_then(text_or_none).or_else(|| {
        let joined = [person.first_name.as_deref(), person.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        text_or_none(&joined)
    })
}

/// "Jane Doe" -> "Jane D."
pub fn mask_name(name: &str) -> String {
    let mut words = name.split_whitespace();
    let first = words.next().unwrap_or_default();
    match words.last().and_then(|last| last.chars().next()) {
        Some(initial) => format!("{first} {}.", initial.to_uppercase()),
        None => first.to_string(),
    }
}

/// "jane@example.com" -> "j***@example.com"
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let head = local.chars().next().map(String::from).unwrap_or_default();
            format!("{head}***@{domain}")
        }
        None => "***".to_string(),
    }
}

/// Keeps the last four digits only.
pub fn mask_phone(phone: &str) -> String {
    let digits = phone.chars().filter(char::is_ascii_digit).collect::<Vec<_>>();
    let tail = digits[digits.len().saturating_sub(4)..].iter().collect::<String>();
    format!("***-***-{tail}")
}

/// Transformer output: the lead column set plus extraction provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformedDeal {
    pub external_deal_id: String,
    pub deal_created_at: Option<DateTime<Utc>>,
    pub fields: LeadFields,
    pub city: Field<String>,
    pub state: Field<String>,
    pub budget: Field<f64>,
    pub services: ServiceMatch,
}

impl TransformedDeal {
    pub fn location(&self) -> Option<&str> {
        self.fields.location.as_deref()
    }
}

/// Pure mapping from a deal (and its resolved person, if any) to lead fields.
pub fn transform_deal(
    deal: &Deal,
    person: Option<&Person>,
    keys: &FieldKeys,
    rules: &ServiceRules,
) -> TransformedDeal {
    let comments = deal.custom_text(&keys.comments).map(|c| html_to_text(&c));
    let venue = comments.as_deref().and_then(venue_location);

    let city = match deal.custom_text(&keys.city).and_then(|c| normalize_city(&c)) {
        Some(city) => Field::with_value(city, Provenance::StructuredField { key: keys.city.clone() }),
        None => match &venue {
            Some((city, _, snippet)) => match normalize_city(city) {
                Some(city) => Field::with_value(city, Provenance::CommentsPattern { snippet: snippet.clone() }),
                None => Field::empty(),
            },
            None => Field::empty(),
        },
    };

    let structured_state = deal
        .custom_text(&keys.state)
        .and_then(|s| normalize_state(&s))
        .map(|abbr| Field::with_value(abbr.to_string(), Provenance::StructuredField { key: keys.state.clone() }));
    let state = structured_state
        .or_else(|| {
            state_from_title(&deal.title).map(|(abbr, segment)| {
                Field::with_value(abbr.to_string(), Provenance::TitleSegment { segment })
            })
        })
        .or_else(|| {
            venue.as_ref().and_then(|(_, state, snippet)| {
                (*state).map(|abbr| {
                    Field::with_value(abbr.to_string(), Provenance::CommentsPattern { snippet: snippet.clone() })
                })
            })
        })
        .unwrap_or_default();

    let location = match (city.value.as_deref(), state.value.as_deref()) {
        (Some(city), Some(state)) => Some(format!("{city}, {state}")),
        (Some(city), None) => Some(city.to_string()),
        (None, Some(state)) => Some(state.to_string()),
        (None, None) => None,
    };

    let description = deal
        .custom_text(&keys.description)
        .map(|d| html_to_text(&d))
        .or_else(|| comments.clone());
    let services = rules.classify(description.as_deref().unwrap_or(&deal.title));
    let services_needed = services.tags();

    let wedding_date = deal.custom_text(&keys.wedding_date).and_then(|d| parse_date(&d));
    let budget = budget_from(deal, &keys.budget);

    let contact_name = person.and_then(person_name);
    let contact_email = person.and_then(|p| primary_contact(&p.email));
    let contact_phone = person.and_then(|p| primary_contact(&p.phone));

    let masked_info = MaskedInfo {
        display_name: contact_name.as_deref().map(mask_name),
        email: contact_email.as_deref().map(mask_email),
        phone: contact_phone.as_deref().map(mask_phone),
        city: city.value.clone(),
        state: state.value.clone(),
        wedding_date,
        services_needed: services_needed.clone(),
    };
    let full_info = FullInfo {
        name: contact_name.clone(),
        email: contact_email.clone(),
        phone: contact_phone.clone(),
        title: deal.title.clone(),
        description: description.clone(),
        comments,
    };

    let deal_created_at = deal.created_at();
    let fields = LeadFields {
        title: deal.title.clone(),
        wedding_date,
        city: city.value.clone(),
        state: state.value.clone(),
        location,
        budget: budget.value,
        description,
        services_needed,
        contact_name,
        contact_email,
        contact_phone,
        masked_info,
        full_info,
        pipeline_id: deal.pipeline_id,
        stage_id: deal.stage_id,
        deal_created_at,
    };

    TransformedDeal {
        external_deal_id: deal.id.clone(),
        deal_created_at,
        fields,
        city,
        state,
        budget,
        services,
    }
}

/// External person record source.
#[async_trait]
pub trait PersonLookup: Send + Sync {
    async fn get_person(&self, person_id: i64) -> Result<Person, CrmError>;
}

#[async_trait]
impl PersonLookup for CrmClient {
    async fn get_person(&self, person_id: i64) -> Result<Person, CrmError> {
        self.get_data(&format!("persons/{person_id}")).await
    }
}

pub struct DealTransformer {
    keys: FieldKeys,
    rules: ServiceRules,
    people: Arc<dyn PersonLookup>,
}

impl DealTransformer {
    pub fn new(people: Arc<dyn PersonLookup>) -> Self {
        Self {
            keys: FieldKeys::default(),
            rules: ServiceRules::default(),
            people,
        }
    }

    pub fn with_keys(mut self, keys: FieldKeys) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_rules(mut self, rules: ServiceRules) -> Self {
        self.rules = rules;
        self
    }

    /// Resolves the person (at most one lookup) and maps the deal.
    pub async fn transform(&self, deal: &Deal) -> Result<TransformedDeal, TransformError> {
        let person = self.resolve_person(deal).await?;
        Ok(transform_deal(deal, person.as_ref(), &self.keys, &self.rules))
    }

    async fn resolve_person(&self, deal: &Deal) -> Result<Option<Person>, TransformError> {
        if let Some(person) = &deal.person {
            return Ok(Some(person.clone()));
        }
        match &deal.person_id {
            None => Ok(None),
            Some(PersonRef::Embedded(embedded)) if !embedded.email.is_empty() || !embedded.phone.is_empty() => {
                Ok(Some(Person {
                    id: embedded.value,
                    name: embedded.name.clone(),
                    first_name: None,
                    last_name: None,
                    email: embedded.email.clone(),
                    phone: embedded.phone.clone(),
                }))
            }
            Some(reference) => {
                let person_id = reference.id();
                debug!(deal_id = %deal.id, person_id, "fetching person");
                self.people
                    .get_person(person_id)
                    .await
                    .map(Some)
                    .map_err(|source| TransformError::PersonLookup { person_id, source })
            }
        }
    }
}
