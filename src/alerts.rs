use crate::model::{AlertCriteria, ListingRecord};
use crate::reconcile::Reconciliation;

impl AlertCriteria {
    /// Conjunctive match over the filters that are set. A listing with an
    /// unknown bedroom count never satisfies a bedroom minimum.
    pub fn matches(&self, record: &ListingRecord) -> bool {
        if !self.active {
            return false;
        }
        if let Some(needle) = self.location_substring.as_deref().filter(|s| !s.is_empty()) {
            if !record
                .location_text
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        if let Some(kind) = self.property_type {
            if record.property_type != kind {
                return false;
            }
        }
        if let Some(min) = self.bedrooms_min {
            match record.bedrooms {
                Some(b) if b >= min => {}
                _ => return false,
            }
        }
        if self.price_min.is_some_and(|min| record.price_minor < min) {
            return false;
        }
        if self.price_max.is_some_and(|max| record.price_minor > max) {
            return false;
        }
        if self.area_min.is_some_and(|min| record.area_sqm < min) {
            return false;
        }
        if self.area_max.is_some_and(|max| record.area_sqm > max) {
            return false;
        }
        true
    }
}

/// Criteria snapshot for one run.
#[derive(Debug, Clone, Default)]
pub struct AlertMatcher {
    criteria: Vec<AlertCriteria>,
}

impl AlertMatcher {
    pub fn new(criteria: Vec<AlertCriteria>) -> Self {
        Self { criteria }
    }

    pub fn len(&self) -> usize {
        self.criteria.len()
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    /// Criteria matching `record`. Only new listings and price changes are
    /// candidates for alerts.
    pub fn evaluate<'a>(
        &'a self,
        record: &ListingRecord,
        outcome: Reconciliation,
    ) -> Vec<&'a AlertCriteria> {
        if !outcome.is_alertable() {
            return Vec::new();
        }
        self.criteria.iter().filter(|c| c.matches(record)).collect()
    }
}
