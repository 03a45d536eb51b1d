//! `Ready` condition handling

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const READY_CONDITION: &str = "Ready";

/// `Ready` condition for the outcome of a pass
pub fn ready_condition(outcome: Result<(), String>, generation: Option<i64>) -> Condition {
    let (status, reason, message) = match outcome {
        Ok(()) => ("True", "Success", "Success".to_string()),
        Err(message) => ("False", "Error", message),
    };
    Condition {
        type_: READY_CONDITION.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message,
        observed_generation: generation,
        last_transition_time: Time(Utc::now()),
    }
}

/// Upserts `new` by type. The transition time is kept unless the status flips.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            if existing.status != new.status {
                existing.status = new.status;
                existing.last_transition_time = new.last_transition_time;
            }
            existing.reason = new.reason;
            existing.message = new.message;
            existing.observed_generation = new.observed_generation;
        }
        None => conditions.push(new),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_ready_condition_shapes() {
        let ok = ready_condition(Ok(()), Some(3));
        assert_eq!(ok.status, "True");
        assert_eq!(ok.reason, "Success");
        assert_eq!(ok.observed_generation, Some(3));

        let failed = ready_condition(Err("boom".to_string()), Some(4));
        assert_eq!(failed.status, "False");
        assert_eq!(failed.reason, "Error");
        assert_eq!(failed.message, "boom");
    }

    #[test]
    fn test_transition_time_kept_when_status_unchanged() {
        let mut first = ready_condition(Ok(()), Some(1));
        let original_time = Time(first.last_transition_time.0 - Duration::hours(1));
        first.last_transition_time = original_time.clone();
        let mut conditions = vec![first];

        set_condition(&mut conditions, ready_condition(Ok(()), Some(2)));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, original_time);
        assert_eq!(conditions[0].observed_generation, Some(2));

        set_condition(&mut conditions, ready_condition(Err("x".to_string()), Some(2)));
        assert_eq!(conditions[0].status, "False");
        assert_ne!(conditions[0].last_transition_time, original_time);
    }
}
