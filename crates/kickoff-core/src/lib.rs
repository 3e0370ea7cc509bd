//! Core domain model, identity derivation and stage vocabulary for the fixture catalog.

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "kickoff-core";

/// Hours east of UTC used when rendering catalog timestamps.
pub const CATALOG_UTC_OFFSET_HOURS: i32 = 3;

/// Competition row as persisted in `competitions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Competition {
    pub id: i64,
    pub name: String,
    pub season: String,
    pub api_url: String,
    pub code: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub need_to_parse: bool,
}

impl Competition {
    /// Builds a freshly discovered competition; the identifier is derived from name and season.
    pub fn discovered(
        code: &str,
        season: &str,
        api_url: String,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> Self {
        let name = competition_display_name(code, season);
        Self {
            id: assign_id(&name),
            name,
            season: season.to_string(),
            api_url,
            code: code.to_string(),
            start_date,
            end_date,
            need_to_parse: true,
        }
    }
}

/// `"{label} {season}"`, where the label is the upstream code except for the European
/// championship which is shown as `Euro`.
pub fn competition_display_name(code: &str, season: &str) -> String {
    let label = match code {
        "EC" => "Euro",
        other => other,
    };
    format!("{label} {season}")
}

/// Upstream lifecycle tag of a fixture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStatus {
    Scheduled,
    Timed,
    InPlay,
    Paused,
    Finished,
    Suspended,
    Postponed,
    Cancelled,
    Awarded,
    Other(String),
}

impl MatchStatus {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "SCHEDULED" => Self::Scheduled,
            "TIMED" => Self::Timed,
            "IN_PLAY" => Self::InPlay,
            "PAUSED" => Self::Paused,
            "FINISHED" => Self::Finished,
            "SUSPENDED" => Self::Suspended,
            "POSTPONED" => Self::Postponed,
            "CANCELLED" => Self::Cancelled,
            "AWARDED" => Self::Awarded,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_tag(&self) -> &str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Timed => "TIMED",
            Self::InPlay => "IN_PLAY",
            Self::Paused => "PAUSED",
            Self::Finished => "FINISHED",
            Self::Suspended => "SUSPENDED",
            Self::Postponed => "POSTPONED",
            Self::Cancelled => "CANCELLED",
            Self::Awarded => "AWARDED",
            Self::Other(tag) => tag,
        }
    }

    /// Only a finished fixture may fill in a stored result.
    pub fn is_concluded(&self) -> bool {
        matches!(self, Self::Finished)
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Canonical bracket stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    GroupMatchday(u8),
    RoundOf32,
    RoundOf16,
    QuarterFinal,
    SemiFinal,
    Final,
}

impl Stage {
    pub fn label(&self) -> String {
        match self {
            Self::GroupMatchday(day) => format!("group matchday {day}"),
            Self::RoundOf32 => "1/16 final".to_string(),
            Self::RoundOf16 => "1/8 final".to_string(),
            Self::QuarterFinal => "1/4 final".to_string(),
            Self::SemiFinal => "1/2 final".to_string(),
            Self::Final => "final".to_string(),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Upstream round code as looked up in the stage table. Group fixtures are qualified
/// by matchday (`GROUP_STAGE_3`); every other stage is used verbatim.
pub fn stage_code(stage: &str, matchday: Option<u32>) -> String {
    match (stage, matchday) {
        ("GROUP_STAGE", Some(day)) => format!("GROUP_STAGE_{day}"),
        (other, _) => other.to_string(),
    }
}

/// Closed lookup from upstream round codes to the canonical vocabulary.
/// `None` means the fixture is outside the tracked bracket and must be dropped.
pub fn normalize_stage(code: &str) -> Option<Stage> {
    let stage = match code {
        "GROUP_STAGE_1" => Stage::GroupMatchday(1),
        "GROUP_STAGE_2" => Stage::GroupMatchday(2),
        "GROUP_STAGE_3" => Stage::GroupMatchday(3),
        "GROUP_STAGE_4" => Stage::GroupMatchday(4),
        "GROUP_STAGE_5" => Stage::GroupMatchday(5),
        "GROUP_STAGE_6" => Stage::GroupMatchday(6),
        "LAST_32" => Stage::RoundOf32,
        "LAST_16" => Stage::RoundOf16,
        "QUARTER_FINALS" => Stage::QuarterFinal,
        "SEMI_FINALS" => Stage::SemiFinal,
        "THIRD_PLACE" | "FINAL" => Stage::Final,
        _ => return None,
    };
    Some(stage)
}

/// Maps a content string to a stable signed 64-bit identifier.
///
/// The first 16 hex characters of the MD5 digest are read as an unsigned 64-bit
/// integer and folded into the signed range with two's-complement wraparound, so
/// values at or above 2^63 become negative.
pub fn assign_id(content: &str) -> i64 {
    let mut hasher = Md5::new();
    hasher.update(content.as_bytes());
    let digest = hex::encode(hasher.finalize());
    // 16 hex chars of a hex-encoded digest always parse.
    let raw = u64::from_str_radix(&digest[..16], 16).unwrap_or_default();
    fold_to_signed(raw)
}

/// `raw - 2^64` for `raw >= 2^63`, otherwise `raw`.
pub fn fold_to_signed(raw: u64) -> i64 {
    if raw > i64::MAX as u64 {
        -((u64::MAX - raw) as i64) - 1
    } else {
        raw as i64
    }
}

pub fn catalog_offset() -> FixedOffset {
    FixedOffset::east_opt(CATALOG_UTC_OFFSET_HOURS * 3600).expect("catalog offset is in range")
}

/// Kickoff as it appears inside match identity content: `YYYY-MM-DD HH:MM:SS+03`.
pub fn canonical_kickoff(kickoff: DateTime<Utc>) -> String {
    kickoff
        .with_timezone(&catalog_offset())
        .format("%Y-%m-%d %H:%M:%S%:::z")
        .to_string()
}

/// Midnight of `date` in the catalog offset, as an instant.
pub fn catalog_midnight(date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_hms_opt(0, 0, 0).expect("midnight is valid");
    catalog_offset()
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

pub fn match_id(
    first_team: &str,
    second_team: &str,
    competition_id: i64,
    kickoff: DateTime<Utc>,
) -> i64 {
    assign_id(&format!(
        "{first_team}{second_team}{competition_id}{}",
        canonical_kickoff(kickoff)
    ))
}

/// Normalized fixture produced by the fetcher, before identity assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureDraft {
    pub first_team: String,
    pub second_team: String,
    pub competition_id: i64,
    pub kickoff: DateTime<Utc>,
    pub first_team_goals: Option<i32>,
    pub second_team_goals: Option<i32>,
    /// 0 = no shootout, 1/2 = side that won the shootout, `None` = not started.
    pub penalty_winner: Option<i16>,
    pub stage: Stage,
    pub status: MatchStatus,
}

impl FixtureDraft {
    pub fn match_id(&self) -> i64 {
        match_id(
            &self.first_team,
            &self.second_team,
            self.competition_id,
            self.kickoff,
        )
    }

    pub fn has_result(&self) -> bool {
        self.first_team_goals.is_some() && self.second_team_goals.is_some()
    }

    pub fn into_record(self) -> MatchRecord {
        MatchRecord {
            id: self.match_id(),
            first_team: self.first_team,
            second_team: self.second_team,
            competition_id: self.competition_id,
            kickoff: self.kickoff,
            first_team_goals: self.first_team_goals,
            second_team_goals: self.second_team_goals,
            penalty_winner: self.penalty_winner,
            stage: self.stage.label(),
        }
    }
}

/// Match row as persisted in `matches`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: i64,
    pub first_team: String,
    pub second_team: String,
    pub competition_id: i64,
    pub kickoff: DateTime<Utc>,
    pub first_team_goals: Option<i32>,
    pub second_team_goals: Option<i32>,
    pub penalty_winner: Option<i16>,
    pub stage: String,
}

/// Result columns of an already persisted match, loaded for reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoredResult {
    pub first_team_goals: Option<i32>,
    pub second_team_goals: Option<i32>,
    pub penalty_winner: Option<i16>,
}

impl StoredResult {
    /// Both goal columns still empty; the row may receive a result.
    pub fn is_open(&self) -> bool {
        self.first_team_goals.is_none() && self.second_team_goals.is_none()
    }
}

/// Result fill-in for a previously open match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultUpdate {
    pub id: i64,
    pub first_team_goals: Option<i32>,
    pub second_team_goals: Option<i32>,
    pub penalty_winner: Option<i16>,
}
