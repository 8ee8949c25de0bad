use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{
    FIELD_COMPLETION_TIME, FIELD_CREATION_TIME, FIELD_DELAYED_UNTIL, FIELD_ID, FIELD_NUM_ATTEMPTS,
    FIELD_PAYLOAD, FIELD_PRIORITY, FIELD_STATE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Initial,
    Queued,
    Working,
    Finished,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Initial => "INITIAL",
            JobState::Queued => "QUEUED",
            JobState::Working => "WORKING",
            JobState::Finished => "FINISHED",
            JobState::Dead => "DEAD",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "INITIAL" => Some(JobState::Initial),
            "QUEUED" => Some(JobState::Queued),
            "WORKING" => Some(JobState::Working),
            "FINISHED" => Some(JobState::Finished),
            "DEAD" => Some(JobState::Dead),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished | JobState::Dead)
    }

    /// Edges of the job lifecycle:
    /// `Initial -> Queued -> Working -> {Finished | Dead | Queued}`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Initial, JobState::Queued)
                | (JobState::Queued, JobState::Working)
                | (JobState::Working, JobState::Finished)
                | (JobState::Working, JobState::Dead)
                | (JobState::Working, JobState::Queued)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub priority: i64,
    pub state: JobState,
    #[serde(default)]
    pub payload: Value,
    pub creation_time: DateTime<Utc>,
    #[serde(default)]
    pub delayed_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,
    pub num_attempts: u32,
}

impl Job {
    /// A fresh record in `Initial`; the ID and creation time are assigned
    /// when the job is first persisted.
    pub(crate) fn new(priority: i64, payload: Value) -> Self {
        Self {
            id: 0,
            priority,
            state: JobState::Initial,
            payload,
            creation_time: DateTime::<Utc>::UNIX_EPOCH,
            delayed_until: None,
            completion_time: None,
            num_attempts: 0,
        }
    }

    /// Move the job along one edge of the lifecycle. Entering `Working`
    /// counts an attempt and entering `Finished` stamps the completion time.
    /// Illegal transitions leave the job untouched.
    pub(crate) fn transition(&mut self, next: JobState, now: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(next) {
            anyhow::bail!(
                "job {} cannot move from {} to {}",
                self.id,
                self.state,
                next
            );
        }
        match next {
            JobState::Working => self.num_attempts += 1,
            JobState::Finished => self.completion_time = Some(now),
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    pub(crate) fn to_fields(&self) -> Result<Vec<(&'static str, String)>> {
        let payload_json = serde_json::to_string(&self.payload)?;
        Ok(vec![
            (FIELD_ID, self.id.to_string()),
            (FIELD_PRIORITY, self.priority.to_string()),
            (FIELD_STATE, self.state.as_str().to_string()),
            (FIELD_PAYLOAD, payload_json),
            (FIELD_CREATION_TIME, self.creation_time.to_rfc3339()),
            (FIELD_DELAYED_UNTIL, format_optional_time(self.delayed_until)),
            (
                FIELD_COMPLETION_TIME,
                format_optional_time(self.completion_time),
            ),
            (FIELD_NUM_ATTEMPTS, self.num_attempts.to_string()),
        ])
    }

    pub(crate) fn from_fields(raw: &HashMap<String, String>) -> Result<Self> {
        let id = raw
            .get(FIELD_ID)
            .ok_or_else(|| anyhow::anyhow!("missing id"))?
            .parse::<u64>()
            .context("invalid id")?;
        let state = raw
            .get(FIELD_STATE)
            .and_then(|value| JobState::parse(value))
            .ok_or_else(|| anyhow::anyhow!("invalid job state"))?;
        let creation_time = raw
            .get(FIELD_CREATION_TIME)
            .and_then(|value| parse_datetime(value))
            .ok_or_else(|| anyhow::anyhow!("missing creation_time"))?;
        let priority = match raw.get(FIELD_PRIORITY) {
            Some(value) => value.parse::<i64>().context("invalid priority")?,
            None => 0,
        };
        let payload = match raw.get(FIELD_PAYLOAD) {
            Some(value) if !value.is_empty() => {
                serde_json::from_str(value).context("invalid payload")?
            }
            _ => Value::Null,
        };
        let num_attempts = match raw.get(FIELD_NUM_ATTEMPTS) {
            Some(value) if !value.is_empty() => {
                value.parse::<u32>().context("invalid num_attempts")?
            }
            _ => 0,
        };

        Ok(Job {
            id,
            priority,
            state,
            payload,
            creation_time,
            delayed_until: raw
                .get(FIELD_DELAYED_UNTIL)
                .and_then(|value| parse_datetime(value)),
            completion_time: raw
                .get(FIELD_COMPLETION_TIME)
                .and_then(|value| parse_datetime(value)),
            num_attempts,
        })
    }
}

fn format_optional_time(value: Option<DateTime<Utc>>) -> String {
    value.map(|dt| dt.to_rfc3339()).unwrap_or_default()
}

fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queued_job() -> Job {
        let mut job = Job::new(50, json!({"foo": "bar"}));
        job.id = 7;
        job.creation_time = Utc::now();
        job.transition(JobState::Queued, Utc::now()).unwrap();
        job
    }

    #[test]
    fn job_state_round_trip() {
        let states = [
            JobState::Initial,
            JobState::Queued,
            JobState::Working,
            JobState::Finished,
            JobState::Dead,
        ];
        for state in states {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse("NOPE"), None);
    }

    #[test]
    fn terminal_states_have_no_exits() {
        let all = [
            JobState::Initial,
            JobState::Queued,
            JobState::Working,
            JobState::Finished,
            JobState::Dead,
        ];
        for terminal in [JobState::Finished, JobState::Dead] {
            assert!(terminal.is_terminal());
            for next in all {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!JobState::Queued.can_transition_to(JobState::Finished));
        assert!(!JobState::Initial.can_transition_to(JobState::Working));
    }

    #[test]
    fn working_counts_attempts_and_finished_stamps_completion() {
        let mut job = queued_job();
        job.transition(JobState::Working, Utc::now()).unwrap();
        assert_eq!(job.num_attempts, 1);
        assert!(job.completion_time.is_none());

        job.transition(JobState::Queued, Utc::now()).unwrap();
        job.transition(JobState::Working, Utc::now()).unwrap();
        assert_eq!(job.num_attempts, 2);

        let done_at = Utc::now();
        job.transition(JobState::Finished, done_at).unwrap();
        assert_eq!(job.completion_time, Some(done_at));
    }

    #[test]
    fn illegal_transition_leaves_job_untouched() {
        let mut job = queued_job();
        let before = job.clone();
        let err = job.transition(JobState::Dead, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("QUEUED"));
        assert_eq!(job, before);
    }

    #[test]
    fn fields_round_trip_through_hash() {
        let mut job = queued_job();
        job.delayed_until = Some(Utc::now());
        let raw: HashMap<String, String> = job
            .to_fields()
            .unwrap()
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        let loaded = Job::from_fields(&raw).unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.priority, 50);
        assert_eq!(loaded.state, JobState::Queued);
        assert_eq!(loaded.payload, json!({"foo": "bar"}));
        assert!(loaded.delayed_until.is_some());
        assert!(loaded.completion_time.is_none());
    }

    #[test]
    fn from_fields_rejects_partial_records() {
        let mut raw = HashMap::new();
        raw.insert(FIELD_STATE.to_string(), "WORKING".to_string());
        assert!(Job::from_fields(&raw).is_err());

        raw.insert(FIELD_ID.to_string(), "3".to_string());
        raw.insert(FIELD_STATE.to_string(), "LOST".to_string());
        raw.insert(FIELD_CREATION_TIME.to_string(), Utc::now().to_rfc3339());
        let err = Job::from_fields(&raw).unwrap_err();
        assert!(err.to_string().contains("state"));
    }

    #[test]
    fn corrupt_attempt_count_is_an_error() {
        let mut raw: HashMap<String, String> = queued_job()
            .to_fields()
            .unwrap()
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        raw.insert(FIELD_NUM_ATTEMPTS.to_string(), "-1".to_string());
        let err = Job::from_fields(&raw).unwrap_err();
        assert!(err.to_string().contains("num_attempts"));

        raw.remove(FIELD_NUM_ATTEMPTS);
        assert_eq!(Job::from_fields(&raw).unwrap().num_attempts, 0);
    }
}
