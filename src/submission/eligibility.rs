//! Audience-rule evaluation.
//!
//! The credential carries only a coarse age bucket, so the bucket's lower
//! bound is the only age a voter can prove. `min_age` passes when the
//! lower bound meets it; `max_age` passes when the lower bound does not
//! exceed it. Gender `all` matches anyone; region rules are set
//! membership over region codes, with an empty set meaning unrestricted.
//! A poll that names a citizenship admits only credentials attesting
//! exactly that citizenship.

use crate::model::{AudienceRules, DemographicsSnapshot};

/// Why a voter fell outside the audience. Internal only: callers collapse
/// this to the generic `Ineligible` code and the audit entry records the
/// rule class, never the voter's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IneligibleReason {
    BelowMinimumAge,
    AboveMaximumAge,
    GenderMismatch,
    RegionNotInAudience,
    CitizenshipRequired,
}

impl IneligibleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IneligibleReason::BelowMinimumAge => "below-minimum-age",
            IneligibleReason::AboveMaximumAge => "above-maximum-age",
            IneligibleReason::GenderMismatch => "gender-mismatch",
            IneligibleReason::RegionNotInAudience => "region-not-in-audience",
            IneligibleReason::CitizenshipRequired => "citizenship-required",
        }
    }
}

/// Evaluate a poll's audience rules against a credential's demographics.
pub fn evaluate(
    rules: &AudienceRules,
    demographics: &DemographicsSnapshot,
) -> Result<(), IneligibleReason> {
    let provable_age = demographics.age_bucket.lower_bound();

    if let Some(min_age) = rules.min_age {
        if provable_age < min_age {
            return Err(IneligibleReason::BelowMinimumAge);
        }
    }
    if let Some(max_age) = rules.max_age {
        if provable_age > max_age {
            return Err(IneligibleReason::AboveMaximumAge);
        }
    }
    if !rules.gender.matches(demographics.gender) {
        return Err(IneligibleReason::GenderMismatch);
    }
    if !rules.regions.is_empty() && !rules.regions.contains(&demographics.region) {
        return Err(IneligibleReason::RegionNotInAudience);
    }
    if let Some(required) = &rules.citizenship {
        if &demographics.citizenship != required {
            return Err(IneligibleReason::CitizenshipRequired);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgeBucket, Gender, GenderRule};

    fn demographics() -> DemographicsSnapshot {
        DemographicsSnapshot {
            age_bucket: AgeBucket::From25To34,
            gender: Gender::Male,
            region: "reg_tbilisi".to_string(),
            citizenship: "GE".to_string(),
        }
    }

    #[test]
    fn test_unrestricted_rules_pass() {
        assert!(evaluate(&AudienceRules::default(), &demographics()).is_ok());
    }

    #[test]
    fn test_min_age_uses_bucket_lower_bound() {
        let rules = AudienceRules {
            min_age: Some(25),
            ..AudienceRules::default()
        };
        assert!(evaluate(&rules, &demographics()).is_ok());

        // A 25-34 holder cannot prove 30; reject.
        let rules = AudienceRules {
            min_age: Some(30),
            ..AudienceRules::default()
        };
        assert_eq!(
            evaluate(&rules, &demographics()),
            Err(IneligibleReason::BelowMinimumAge)
        );
    }

    #[test]
    fn test_max_age_uses_bucket_lower_bound() {
        let rules = AudienceRules {
            max_age: Some(34),
            ..AudienceRules::default()
        };
        assert!(evaluate(&rules, &demographics()).is_ok());

        let mut older = demographics();
        older.age_bucket = AgeBucket::From65;
        assert_eq!(
            evaluate(&rules, &older),
            Err(IneligibleReason::AboveMaximumAge)
        );
    }

    #[test]
    fn test_gender_rule() {
        let rules = AudienceRules {
            gender: GenderRule::Female,
            ..AudienceRules::default()
        };
        assert_eq!(
            evaluate(&rules, &demographics()),
            Err(IneligibleReason::GenderMismatch)
        );

        let rules = AudienceRules {
            gender: GenderRule::Male,
            ..AudienceRules::default()
        };
        assert!(evaluate(&rules, &demographics()).is_ok());
    }

    #[test]
    fn test_region_set_membership() {
        let rules = AudienceRules {
            regions: vec!["reg_batumi".to_string(), "reg_kutaisi".to_string()],
            ..AudienceRules::default()
        };
        assert_eq!(
            evaluate(&rules, &demographics()),
            Err(IneligibleReason::RegionNotInAudience)
        );

        let rules = AudienceRules {
            regions: vec!["reg_tbilisi".to_string()],
            ..AudienceRules::default()
        };
        assert!(evaluate(&rules, &demographics()).is_ok());
    }

    #[test]
    fn test_citizenship_requirement() {
        let rules = AudienceRules {
            citizenship: Some("GE".to_string()),
            ..AudienceRules::default()
        };
        assert!(evaluate(&rules, &demographics()).is_ok());

        let mut foreign = demographics();
        foreign.citizenship = "DE".to_string();
        assert_eq!(
            evaluate(&rules, &foreign),
            Err(IneligibleReason::CitizenshipRequired)
        );

        // No rule: any citizenship passes.
        assert!(evaluate(&AudienceRules::default(), &foreign).is_ok());
    }
}
