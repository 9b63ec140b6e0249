//! Domain model: polls, options, audience rules, demographic buckets.
//!
//! Polls and options are owned by the admin plane; the core only reads
//! them. Votes carry a coarse-bucketed timestamp and a demographics
//! snapshot of exactly four bucket fields - never a subject id, device id,
//! IP, or personal number. The per-row `bucket_ts` is visible to any
//! database reader; deployments with small polls should widen
//! `bucket_seconds` accordingly.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Poll lifecycle status. Transitions draft -> scheduled -> active -> ended
/// -> archived are linear and owned by the admin plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollStatus {
    Draft,
    Scheduled,
    Active,
    Ended,
    Archived,
}

impl PollStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollStatus::Draft => "draft",
            PollStatus::Scheduled => "scheduled",
            PollStatus::Active => "active",
            PollStatus::Ended => "ended",
            PollStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(PollStatus::Draft),
            "scheduled" => Some(PollStatus::Scheduled),
            "active" => Some(PollStatus::Active),
            "ended" => Some(PollStatus::Ended),
            "archived" => Some(PollStatus::Archived),
            _ => None,
        }
    }
}

/// Poll kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollKind {
    Referendum,
    Election,
    Survey,
}

impl PollKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollKind::Referendum => "referendum",
            PollKind::Election => "election",
            PollKind::Survey => "survey",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "referendum" => Some(PollKind::Referendum),
            "election" => Some(PollKind::Election),
            "survey" => Some(PollKind::Survey),
            _ => None,
        }
    }
}

/// Voter gender as attested by the enrollment credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Gender {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "M",
            Gender::Female => "F",
        }
    }
}

/// Poll audience gender rule. `All` matches any credential gender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenderRule {
    #[serde(rename = "all")]
    All,
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
}

impl GenderRule {
    pub fn matches(&self, gender: Gender) -> bool {
        match self {
            GenderRule::All => true,
            GenderRule::Male => gender == Gender::Male,
            GenderRule::Female => gender == Gender::Female,
        }
    }
}

/// Coarse age bucket carried by the enrollment credential.
///
/// The credential never carries a birth date, so the bucket's lower bound
/// is the only age the voter can prove.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgeBucket {
    #[serde(rename = "18-24")]
    From18To24,
    #[serde(rename = "25-34")]
    From25To34,
    #[serde(rename = "35-44")]
    From35To44,
    #[serde(rename = "45-54")]
    From45To54,
    #[serde(rename = "55-64")]
    From55To64,
    #[serde(rename = "65+")]
    From65,
}

impl AgeBucket {
    /// Lowest age a holder of this bucket is guaranteed to have.
    pub fn lower_bound(&self) -> u8 {
        match self {
            AgeBucket::From18To24 => 18,
            AgeBucket::From25To34 => 25,
            AgeBucket::From35To44 => 35,
            AgeBucket::From45To54 => 45,
            AgeBucket::From55To64 => 55,
            AgeBucket::From65 => 65,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgeBucket::From18To24 => "18-24",
            AgeBucket::From25To34 => "25-34",
            AgeBucket::From35To44 => "35-44",
            AgeBucket::From45To54 => "45-54",
            AgeBucket::From55To64 => "55-64",
            AgeBucket::From65 => "65+",
        }
    }
}

/// Demographics snapshot stored with a vote.
///
/// Exactly these four bucket fields and nothing else. Unknown keys are
/// rejected on ingress so a compromised client cannot smuggle identifying
/// fields into the vote table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DemographicsSnapshot {
    pub age_bucket: AgeBucket,
    pub gender: Gender,
    pub region: String,
    pub citizenship: String,
}

/// Audience rules attached to a poll. Unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AudienceRules {
    #[serde(default)]
    pub min_age: Option<u8>,
    #[serde(default)]
    pub max_age: Option<u8>,
    #[serde(default = "default_gender_rule")]
    pub gender: GenderRule,
    /// Region codes; empty means no region restriction.
    #[serde(default)]
    pub regions: Vec<String>,
    /// Required citizenship code; `None` means no citizenship restriction.
    #[serde(default)]
    pub citizenship: Option<String>,
}

fn default_gender_rule() -> GenderRule {
    GenderRule::All
}

impl Default for AudienceRules {
    fn default() -> Self {
        Self {
            min_age: None,
            max_age: None,
            gender: GenderRule::All,
            regions: Vec::new(),
            citizenship: None,
        }
    }
}

/// A poll as read from the admin plane's tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poll {
    pub id: String,
    pub title: String,
    pub kind: PollKind,
    pub status: PollStatus,
    pub audience: AudienceRules,
    /// K-anonymity floor for published analytics.
    pub min_k_anonymity: u32,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Poll {
    /// Whether ballots are accepted at `now`: status must be active and
    /// `now` must fall within the configured window.
    pub fn accepts_ballots_at(&self, now: DateTime<Utc>) -> bool {
        if self.status != PollStatus::Active {
            return false;
        }
        if let Some(starts) = self.starts_at {
            if now < starts {
                return false;
            }
        }
        if let Some(ends) = self.ends_at {
            if now > ends {
                return false;
            }
        }
        true
    }
}

/// An option belonging to a poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollOption {
    pub id: String,
    pub poll_id: String,
    pub label: String,
    pub display_order: i64,
}

/// A recorded vote row. Carries no voter identity; the nullifier is an
/// opaque keyed hash and the timestamp is bucketed.
#[derive(Debug, Clone)]
pub struct VoteRow {
    pub id: String,
    pub poll_id: String,
    pub option_id: String,
    /// Sequence position within the poll; equals the Merkle leaf index.
    pub poll_seq: i64,
    pub nullifier: String,
    pub bucket_ts: DateTime<Utc>,
    pub demographics: DemographicsSnapshot,
}

/// Round `now` down to the start of its bucket window.
pub fn bucket_timestamp(now: DateTime<Utc>, window_secs: u64) -> DateTime<Utc> {
    let window = window_secs.max(1) as i64;
    let secs = now.timestamp().div_euclid(window) * window;
    Utc.timestamp_opt(secs, 0).single().unwrap_or(now)
}

/// Format a bucket timestamp the way Merkle leaves expect it: ISO 8601 UTC
/// with millisecond precision. Frozen; external verifiers depend on it.
pub fn format_bucket_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Parse a bucket timestamp previously written by [`format_bucket_ts`].
pub fn parse_bucket_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
