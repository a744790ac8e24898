use crate::error::{QcError, Result};
use crate::timeseries::{BoolMask, RegularTimeSeries};
use std::fmt;
use std::sync::Arc;

/// A pure function of the table returning one violation flag per row
pub type Predicate = Arc<dyn Fn(&RegularTimeSeries) -> Result<BoolMask> + Send + Sync>;

/// An immutable named check
#[derive(Clone)]
pub struct QcRule {
    name: String,
    description: String,
    predicate: Predicate,
}

impl QcRule {
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&RegularTimeSeries) -> Result<BoolMask> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Run the predicate and check that it produced one flag per row
    pub fn evaluate(&self, ts: &RegularTimeSeries) -> Result<BoolMask> {
        let mask = (self.predicate)(ts)?;
        if mask.len() != ts.len() {
            return Err(QcError::MaskLength {
                expected: ts.len(),
                found: mask.len(),
            });
        }
        Ok(mask)
    }
}

impl fmt::Debug for QcRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QcRule")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}
