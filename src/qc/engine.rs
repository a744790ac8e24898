use super::QcRule;
use crate::constants::{VALID, VALID_DESCRIPTION};
use crate::error::{QcError, Result};
use crate::models::{QcSummary, QcSummaryRow};
use crate::timeseries::RegularTimeSeries;
use tracing::{debug, info};

/// Ordered rule set producing a single flag per row
#[derive(Debug, Clone, Default)]
pub struct QcFlagBuilder {
    rules: Vec<QcRule>,
    /// Labels added after the first pass, with their descriptions
    derived: Vec<(String, String)>,
}

impl QcFlagBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule; earlier rules take priority
    pub fn add_rule(&mut self, rule: QcRule) -> &mut Self {
        self.rules.push(rule);
        self
    }

    pub fn add_rules(&mut self, rules: impl IntoIterator<Item = QcRule>) -> &mut Self {
        self.rules.extend(rules);
        self
    }

    pub fn with_rules(mut self, rules: impl IntoIterator<Item = QcRule>) -> Self {
        self.add_rules(rules);
        self
    }

    pub fn rules(&self) -> &[QcRule] {
        &self.rules
    }

    /// Every label this engine can assign besides Valid, in priority order
    pub fn labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = Vec::new();
        let names = self
            .rules
            .iter()
            .map(QcRule::name)
            .chain(self.derived.iter().map(|(name, _)| name.as_str()));
        for name in names {
            if !labels.contains(&name) {
                labels.push(name);
            }
        }
        labels
    }

    /// Flag every row with the first rule whose predicate rejects it.
    ///
    /// Rows no rule rejects are `Valid`. Any existing flag column is replaced.
    pub fn apply(&self, ts: &RegularTimeSeries) -> Result<RegularTimeSeries> {
        let mut flags = vec![VALID.to_string(); ts.len()];
        let mut assigned = vec![false; ts.len()];

        for rule in &self.rules {
            let mask = rule.evaluate(ts)?;
            let hits = mask.iter().filter(|hit| **hit).count();
            let mut claimed = 0;
            for (row, hit) in mask.into_iter().enumerate() {
                if hit && !assigned[row] {
                    flags[row] = rule.name().to_string();
                    assigned[row] = true;
                    claimed += 1;
                }
            }
            info!(
                "QC rule '{}': {} rows matched, {} flagged",
                rule.name(),
                hits,
                claimed
            );
        }

        let mut flagged = ts.clone();
        flagged.set_flags(flags)?;
        Ok(flagged)
    }

    /// Count each flag value, with percentages of all rows.
    ///
    /// Rows follow rule priority, then any unregistered labels in order of
    /// appearance, and always end with Valid.
    pub fn get_summary(&self, ts: &RegularTimeSeries) -> Result<QcSummary> {
        let flags = ts.require_flags()?;
        let total = flags.len();

        let mut order: Vec<&str> = self.labels();
        for flag in flags {
            if flag != VALID && !order.contains(&flag.as_str()) {
                order.push(flag.as_str());
            }
        }

        let percentage = |count: usize| {
            if total == 0 {
                0.0
            } else {
                (count as f64 / total as f64 * 1000.0).round() / 10.0
            }
        };

        let mut rows: Vec<QcSummaryRow> = order
            .into_iter()
            .filter(|label| *label != VALID)
            .filter_map(|label| {
                let count = flags.iter().filter(|f| f.as_str() == label).count();
                (count > 0).then(|| QcSummaryRow {
                    rule: label.to_string(),
                    count,
                    percentage: percentage(count),
                    description: self.description(label),
                })
            })
            .collect();

        let valid = flags.iter().filter(|f| f.as_str() == VALID).count();
        rows.push(QcSummaryRow {
            rule: VALID.to_string(),
            count: valid,
            percentage: percentage(valid),
            description: VALID_DESCRIPTION.to_string(),
        });

        Ok(QcSummary { rows })
    }

    /// Relabel rows that are still Valid and match `extra_mask`.
    ///
    /// Rows carrying any other label keep it. Returns the number of rows
    /// relabelled and registers `new_label` for the summary.
    pub fn update_qc_flag(
        &mut self,
        ts: &mut RegularTimeSeries,
        extra_mask: &[bool],
        new_label: &str,
        description: &str,
    ) -> Result<usize> {
        let len = ts.len();
        let flags = ts.flags_mut().ok_or_else(|| QcError::MissingColumn {
            column: crate::constants::QC_FLAG_COLUMN.to_string(),
            context: format!("relabelling rows as '{new_label}'"),
        })?;
        if extra_mask.len() != len {
            return Err(QcError::MaskLength {
                expected: len,
                found: extra_mask.len(),
            });
        }

        let mut relabelled = 0;
        for (flag, hit) in flags.iter_mut().zip(extra_mask) {
            if *hit && flag == VALID {
                *flag = new_label.to_string();
                relabelled += 1;
            }
        }

        if !self.labels().contains(&new_label) {
            self.derived
                .push((new_label.to_string(), description.to_string()));
        }
        debug!("Relabelled {} Valid rows as '{}'", relabelled, new_label);
        Ok(relabelled)
    }

    fn description(&self, label: &str) -> String {
        self.rules
            .iter()
            .find(|r| r.name() == label)
            .map(|r| r.description().to_string())
            .or_else(|| {
                self.derived
                    .iter()
                    .find(|(name, _)| name == label)
                    .map(|(_, description)| description.clone())
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeseries::{Frequency, parse_timestamp};

    fn table(values: Vec<f64>) -> RegularTimeSeries {
        let len = values.len();
        RegularTimeSeries::new(parse_timestamp("2024-02-01").unwrap(), Frequency::HOUR, len)
            .with_channel("x", values)
            .unwrap()
    }

    fn above(name: &str, limit: f64) -> QcRule {
        QcRule::new(name, format!("x above {limit}"), move |ts| {
            Ok(ts
                .require_channel("x", "threshold rule")?
                .iter()
                .map(|v| *v > limit)
                .collect())
        })
    }

    #[test]
    fn test_empty_rule_list_is_all_valid() {
        let flagged = QcFlagBuilder::new().apply(&table(vec![1.0, 2.0])).unwrap();
        assert_eq!(flagged.flags().unwrap(), &["Valid", "Valid"]);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let mut engine = QcFlagBuilder::new();
        engine.add_rule(above("High", 5.0)).add_rule(above("Very High", 10.0));

        let flagged = engine.apply(&table(vec![1.0, 7.0, 50.0])).unwrap();

        assert_eq!(flagged.flags().unwrap(), &["Valid", "High", "High"]);
    }

    #[test]
    fn test_every_flag_is_valid_or_a_rule_name() {
        let engine =
            QcFlagBuilder::new().with_rules([above("Very High", 10.0), above("High", 5.0)]);
        let flagged = engine
            .apply(&table(vec![1.0, 7.0, 50.0, f64::NAN, 3.0]))
            .unwrap();
        let labels = engine.labels();
        assert_eq!(flagged.flags().unwrap().len(), 5);
        for flag in flagged.flags().unwrap() {
            assert!(flag == VALID || labels.contains(&flag.as_str()));
        }
        assert_eq!(flagged.flags().unwrap()[2], "Very High");
    }

    #[test]
    fn test_all_false_predicate_contributes_nothing() {
        let engine = QcFlagBuilder::new()
            .with_rules([QcRule::new("Never", "never fires", |ts| Ok(vec![false; ts.len()]))]);
        let flagged = engine.apply(&table(vec![1.0, 2.0])).unwrap();
        let summary = engine.get_summary(&flagged).unwrap();
        assert!(summary.get("Never").is_none());
        assert_eq!(summary.count(VALID), 2);
    }

    #[test]
    fn test_summary_counts_add_up_and_end_with_valid() {
        let engine = QcFlagBuilder::new().with_rules([above("High", 0.0)]);
        let flagged = engine.apply(&table(vec![1.0, 2.0, 3.0])).unwrap();

        let summary = engine.get_summary(&flagged).unwrap();

        assert_eq!(summary.total(), 3);
        let last = summary.rows.last().unwrap();
        assert_eq!(last.rule, VALID);
        assert_eq!(last.count, 0);
        assert_eq!(last.percentage, 0.0);
        let high = summary.get("High").unwrap();
        assert_eq!(high.percentage, 100.0);
        assert_eq!(high.description, "x above 0");
    }

    #[test]
    fn test_summary_percentages_are_rounded() {
        let engine = QcFlagBuilder::new().with_rules([above("High", 5.0)]);
        let flagged = engine.apply(&table(vec![9.0, 1.0, 1.0])).unwrap();
        let summary = engine.get_summary(&flagged).unwrap();
        assert_eq!(summary.get("High").unwrap().percentage, 33.3);
        assert_eq!(summary.get(VALID).unwrap().percentage, 66.7);
    }

    #[test]
    fn test_update_qc_flag_never_overrides_invalid_rows() {
        let mut engine = QcFlagBuilder::new().with_rules([above("High", 5.0)]);
        let mut flagged = engine.apply(&table(vec![9.0, 1.0, 2.0])).unwrap();

        let relabelled = engine
            .update_qc_flag(&mut flagged, &[true, true, false], "Invalid AAE", "AAE out of range")
            .unwrap();

        assert_eq!(relabelled, 1);
        assert_eq!(flagged.flags().unwrap(), &["High", "Invalid AAE", "Valid"]);
        let summary = engine.get_summary(&flagged).unwrap();
        assert_eq!(
            summary.get("Invalid AAE").unwrap().description,
            "AAE out of range"
        );
    }

    #[test]
    fn test_update_qc_flag_requires_flags() {
        let mut engine = QcFlagBuilder::new();
        let mut raw = table(vec![1.0]);
        match engine.update_qc_flag(&mut raw, &[true], "Late", "late check") {
            Err(QcError::MissingColumn { .. }) => {}
            other => panic!("Expected MissingColumn error, got {other:?}"),
        }
    }

    #[test]
    fn test_predicate_schema_errors_propagate() {
        let engine = QcFlagBuilder::new().with_rules([QcRule::new("Needs y", "", |ts| {
            ts.require_channel("y", "test rule").map(|v| v.iter().map(|_| false).collect())
        })]);
        match engine.apply(&table(vec![1.0])) {
            Err(QcError::MissingColumn { column, .. }) => assert_eq!(column, "y"),
            other => panic!("Expected MissingColumn error, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_mask_length_is_rejected() {
        let engine =
            QcFlagBuilder::new().with_rules([QcRule::new("Short", "", |_| Ok(vec![true]))]);
        assert!(matches!(
            engine.apply(&table(vec![1.0, 2.0])),
            Err(QcError::MaskLength {
                expected: 2,
                found: 1
            })
        ));
    }
}
