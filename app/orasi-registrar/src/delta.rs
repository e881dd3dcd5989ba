//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Set differences between two generations of records
//!
//! `service_delta(old, new)` yields the additions; swapping the arguments
//! yields the removals.

use crate::types::{HealthCheckRecord, ServiceRecord};

/// How two checks are matched when computing a delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckDeltaMode {
    /// Checks match only when every field is equal
    Add,
    /// Checks also match when their ids are equal
    ///
    /// A check whose content changed is re-registered under the same id by
    /// the register stage, so cleanup must not remove it.
    Purge,
}

/// Records in `new` without a field-equal counterpart in `old`
pub fn service_delta(old: &[ServiceRecord], new: &[ServiceRecord]) -> Vec<ServiceRecord> {
    new.iter()
        .filter(|record| !old.contains(record))
        .cloned()
        .collect()
}

/// Checks in `new` without a matching counterpart in `old`
pub fn check_delta(
    old: &[HealthCheckRecord],
    new: &[HealthCheckRecord],
    mode: CheckDeltaMode,
) -> Vec<HealthCheckRecord> {
    new.iter()
        .filter(|check| {
            !old.iter().any(|existing| match mode {
                CheckDeltaMode::Add => existing == *check,
                CheckDeltaMode::Purge => existing.id == check.id || existing == *check,
            })
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CheckSpec;

    fn service(id: &str, port: u16, tags: &[&str]) -> ServiceRecord {
        ServiceRecord::new(
            id.to_string(),
            "web",
            "10.0.0.1",
            port,
            tags.iter().copied(),
        )
    }

    fn check(id: &str, url: &str) -> HealthCheckRecord {
        HealthCheckRecord {
            id: id.to_string(),
            name: "HTTP".to_string(),
            service_id: "svc".to_string(),
            spec: CheckSpec::Http(url.to_string()),
            interval: None,
            timeout: None,
        }
    }

    #[test]
    fn test_tag_order_does_not_produce_delta() {
        let old = vec![service("p:1", 80, &["a", "b", "c"])];
        let new = vec![service("p:1", 80, &["c", "a", "b"])];

        assert!(service_delta(&old, &new).is_empty());
        assert!(service_delta(&new, &old).is_empty());
    }

    #[test]
    fn test_additions_and_removals() {
        let old = vec![service("p:1", 80, &[]), service("p:2", 80, &[])];
        let new = vec![service("p:2", 80, &[]), service("p:3", 80, &[])];

        let additions = service_delta(&old, &new);
        assert_eq!(additions.len(), 1);
        assert_eq!(additions[0].id, "p:3");

        let removals = service_delta(&new, &old);
        assert_eq!(removals.len(), 1);
        assert_eq!(removals[0].id, "p:1");
    }

    #[test]
    fn test_changed_field_is_an_addition() {
        let old = vec![service("p:1", 80, &["a"])];
        let new = vec![service("p:1", 81, &["a"])];

        assert_eq!(service_delta(&old, &new).len(), 1);
        assert_eq!(service_delta(&old, &[service("p:1", 80, &["a", "b"])]).len(), 1);
    }

    #[test]
    fn test_cleared_previous_matches_empty_previous() {
        let current = vec![service("p:1", 80, &[]), service("p:2", 0, &[])];

        assert_eq!(service_delta(&[], &current), current);
        assert!(service_delta(&current, &current).is_empty());
    }

    #[test]
    fn test_check_add_mode_detects_content_change() {
        let old = vec![check("http:svc", "http://10.0.0.1:80/")];
        let new = vec![check("http:svc", "http://10.0.0.2:80/")];

        assert_eq!(check_delta(&old, &new, CheckDeltaMode::Add).len(), 1);
    }

    #[test]
    fn test_check_purge_mode_keeps_updated_checks() {
        let previous = vec![
            check("http:svc", "http://10.0.0.1:80/"),
            check("tcp:svc", "10.0.0.1:80"),
        ];
        let current = vec![check("http:svc", "http://10.0.0.2:80/")];

        // Content update of http:svc is not torn down, tcp:svc is gone
        let removals = check_delta(&current, &previous, CheckDeltaMode::Purge);
        assert_eq!(removals.len(), 1);
        assert_eq!(removals[0].id, "tcp:svc");

        // Add mode would have removed the updated check as well
        assert_eq!(
            check_delta(&current, &previous, CheckDeltaMode::Add).len(),
            2
        );
    }
}
