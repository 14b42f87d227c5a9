// ⚖️ Source Arbitrator - one canonical row set per fund from many crawlers
//
// Two strategies:
//   - Whole-entity (funds, fees, holdings, allocations, statistics): pick ONE
//     source per fund and take all of its rows. The default source wins unless
//     another source is more than `stale_after_days` fresher.
//   - Field-level (daily NAV): merge per field. Agreeing values and nulls are
//     coalesced; real conflicts go to the later scrape.
// Codes are a union keyed by (fund_code, code).
//
// Whenever nothing else decides, the fixed ordering
// Finnomena < WealthMagik < Sec picks the winner, so output is deterministic.

use chrono::{NaiveDate, NaiveDateTime};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use tracing::debug;

use crate::records::{
    BusinessKey, CodeRecord, DailyNavRecord, Source, TableRecord, UnitRecords,
};

/// Default source loses only when another source is this many days fresher
pub const DEFAULT_STALE_AFTER_DAYS: i64 = 60;

/// Two NAV values closer than this are the same value
pub const DEFAULT_NAV_EPSILON: f64 = 0.0001;

// ============================================================================
// ARBITRATOR
// ============================================================================

#[derive(Debug, Clone)]
pub struct SourceArbitrator {
    /// Preferred source for whole-entity tables
    pub default_source: Source,

    pub stale_after_days: i64,

    pub nav_epsilon: f64,
}

impl SourceArbitrator {
    pub fn new() -> Self {
        Self {
            default_source: Source::Finnomena,
            stale_after_days: DEFAULT_STALE_AFTER_DAYS,
            nav_epsilon: DEFAULT_NAV_EPSILON,
        }
    }

    pub fn with_thresholds(default_source: Source, stale_after_days: i64, nav_epsilon: f64) -> Self {
        Self {
            default_source,
            stale_after_days,
            nav_epsilon,
        }
    }

    /// Reduce one unit's per-source candidates to canonical rows.
    pub fn arbitrate(&self, candidates: UnitRecords) -> UnitRecords {
        UnitRecords {
            funds: self.arbitrate_entities(candidates.funds),
            fees: self.arbitrate_entities(candidates.fees),
            holdings: self.arbitrate_entities(candidates.holdings),
            allocations: self.arbitrate_entities(candidates.allocations),
            navs: self.merge_navs(candidates.navs),
            codes: self.union_codes(candidates.codes),
            statistics: self.arbitrate_entities(candidates.statistics),
        }
    }

    // ========================================================================
    // WHOLE-ENTITY
    // ========================================================================

    /// Pick one source per fund and keep only that source's rows.
    ///
    /// A source group's freshness is the newest `as_of` among its rows.
    pub fn arbitrate_entities<R: TableRecord>(&self, rows: Vec<R>) -> Vec<R> {
        let mut by_fund: BTreeMap<String, BTreeMap<Source, Vec<R>>> = BTreeMap::new();
        for row in rows {
            by_fund
                .entry(row.fund_code().to_string())
                .or_default()
                .entry(row.source())
                .or_default()
                .push(row);
        }

        let mut canonical = Vec::new();
        for (fund_code, mut groups) in by_fund {
            let freshness: BTreeMap<Source, Option<NaiveDate>> = groups
                .iter()
                .map(|(source, rows)| (*source, rows.iter().filter_map(|r| r.as_of()).max()))
                .collect();

            let Some(chosen) = self.choose_source(&freshness) else {
                continue;
            };

            if freshness.len() > 1 {
                debug!(table = %R::TABLE, fund_code = %fund_code, source = %chosen, "source chosen");
            }

            if let Some(rows) = groups.remove(&chosen) {
                canonical.extend(collapse_by_key(rows));
            }
        }
        canonical
    }

    /// Decide which source wins given each source's freshness date.
    ///
    /// A missing `as_of` can never prove the default stale.
    pub fn choose_source(&self, freshness: &BTreeMap<Source, Option<NaiveDate>>) -> Option<Source> {
        if freshness.len() <= 1 {
            return freshness.keys().next().copied();
        }

        if let Some(default_as_of) = freshness.get(&self.default_source) {
            let Some(default_as_of) = default_as_of else {
                return Some(self.default_source);
            };

            let mut winner = self.default_source;
            let mut winner_as_of: Option<NaiveDate> = None;
            for (source, as_of) in freshness {
                if *source == self.default_source {
                    continue;
                }
                let Some(as_of) = as_of else { continue };
                let newer_by = (*as_of - *default_as_of).num_days();
                if newer_by > self.stale_after_days && winner_as_of.map_or(true, |best| *as_of > best) {
                    winner = *source;
                    winner_as_of = Some(*as_of);
                }
            }
            return Some(winner);
        }

        // No default source: freshest wins, fixed ordering on ties
        let mut winner: Option<(Source, Option<NaiveDate>)> = None;
        for (source, as_of) in freshness {
            match winner {
                Some((_, best)) if *as_of <= best => {}
                _ => winner = Some((*source, *as_of)),
            }
        }
        winner.map(|(source, _)| source)
    }

    // ========================================================================
    // FIELD-LEVEL (NAV)
    // ========================================================================

    /// Merge NAV rows sharing (fund_code, nav_date) field by field.
    pub fn merge_navs(&self, rows: Vec<DailyNavRecord>) -> Vec<DailyNavRecord> {
        let mut by_key: BTreeMap<BusinessKey, BTreeMap<Source, DailyNavRecord>> = BTreeMap::new();
        for row in rows {
            by_key
                .entry(row.business_key())
                .or_default()
                .insert(row.source, row);
        }

        by_key
            .into_values()
            .filter_map(|per_source| {
                let candidates: Vec<DailyNavRecord> = per_source.into_values().collect();
                self.merge_nav_candidates(&candidates)
            })
            .collect()
    }

    /// Candidates must be in fixed source order.
    fn merge_nav_candidates(&self, candidates: &[DailyNavRecord]) -> Option<DailyNavRecord> {
        let first = candidates.first()?;
        if candidates.len() == 1 {
            return Some(first.clone());
        }

        let nav_value = self.pick_field(candidates, "nav_value", |r| r.nav_value);
        let aum = self.pick_field(candidates, "aum", |r| r.aum);
        let bid = self.pick_field(candidates, "bid", |r| r.bid);
        let offer = self.pick_field(candidates, "offer", |r| r.offer);

        Some(DailyNavRecord {
            fund_code: first.fund_code.clone(),
            nav_date: first.nav_date,
            nav_value: nav_value.map(|p| p.value),
            aum: aum.map(|p| p.value),
            bid: bid.map(|p| p.value),
            offer: offer.map(|p| p.value),
            source: nav_value.map(|p| p.source).unwrap_or(first.source),
            scraped_at: candidates.iter().filter_map(|r| r.scraped_at).max(),
        })
    }

    fn pick_field<F>(&self, candidates: &[DailyNavRecord], field: &str, value_of: F) -> Option<FieldPick>
    where
        F: Fn(&DailyNavRecord) -> Option<f64>,
    {
        let mut held: Option<FieldPick> = None;
        for record in candidates {
            let Some(value) = value_of(record) else {
                continue;
            };
            let offered = FieldPick {
                value,
                source: record.source,
                scraped_at: record.scraped_at,
            };

            held = Some(match held {
                None => offered,
                Some(current) if (current.value - value).abs() <= self.nav_epsilon => current,
                Some(current) => match (current.scraped_at, offered.scraped_at) {
                    (Some(held_at), Some(offered_at)) if offered_at > held_at => {
                        debug!(
                            fund_code = %record.fund_code,
                            nav_date = %record.nav_date,
                            field,
                            kept = %offered.source,
                            dropped = %current.source,
                            "conflict resolved by scrape time"
                        );
                        offered
                    }
                    _ => current,
                },
            });
        }
        held
    }

    // ========================================================================
    // CODES
    // ========================================================================

    /// Union of all sources' codes; a (fund_code, code) collision keeps the
    /// row of the earlier source and fills a missing code_type from the other.
    pub fn union_codes(&self, rows: Vec<CodeRecord>) -> Vec<CodeRecord> {
        let mut merged: BTreeMap<BusinessKey, CodeRecord> = BTreeMap::new();
        for row in rows {
            match merged.entry(row.business_key()) {
                Entry::Vacant(slot) => {
                    slot.insert(row);
                }
                Entry::Occupied(mut slot) => {
                    let held = slot.get_mut();
                    if row.source < held.source {
                        let code_type = row.code_type.clone().or_else(|| held.code_type.take());
                        *held = row;
                        held.code_type = code_type;
                    } else if held.code_type.is_none() {
                        held.code_type = row.code_type;
                    }
                }
            }
        }
        merged.into_values().collect()
    }
}

impl Default for SourceArbitrator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
struct FieldPick {
    value: f64,
    source: Source,
    scraped_at: Option<NaiveDateTime>,
}

/// Last row wins within one source's group.
fn collapse_by_key<R: TableRecord>(rows: Vec<R>) -> Vec<R> {
    let mut keyed: BTreeMap<BusinessKey, R> = BTreeMap::new();
    for row in rows {
        keyed.insert(row.business_key(), row);
    }
    keyed.into_values().collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::FeeRecord;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(hour: u32) -> NaiveDateTime {
        date(2024, 5, 2).and_hms_opt(hour, 0, 0).unwrap()
    }

    fn create_test_nav(source: Source, value: Option<f64>, scraped_hour: Option<u32>) -> DailyNavRecord {
        DailyNavRecord {
            fund_code: "K-USA-A".to_string(),
            nav_date: date(2024, 5, 1),
            nav_value: value,
            aum: None,
            bid: None,
            offer: None,
            source,
            scraped_at: scraped_hour.map(at),
        }
    }

    fn create_test_fee(source: Source, as_of: Option<NaiveDate>, management: f64) -> FeeRecord {
        FeeRecord {
            fund_code: "SCBSET".to_string(),
            front_end_max: Some(1.5),
            front_end_actual: None,
            back_end_max: None,
            back_end_actual: None,
            management_max: None,
            management_actual: Some(management),
            ter_max: None,
            ter_actual: None,
            switching_in_max: None,
            switching_in_actual: None,
            switching_out_max: None,
            switching_out_actual: None,
            min_initial_buy: None,
            min_next_buy: None,
            source,
            as_of,
        }
    }

    #[test]
    fn test_nav_conflict_goes_to_later_scrape() {
        let arbitrator = SourceArbitrator::new();
        let merged = arbitrator.merge_navs(vec![
            create_test_nav(Source::Finnomena, Some(10.00), Some(9)),
            create_test_nav(Source::WealthMagik, Some(10.05), Some(10)),
        ]);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].nav_value, Some(10.05));
        assert_eq!(merged[0].source, Source::WealthMagik);
        assert_eq!(merged[0].scraped_at, Some(at(10)));
    }

    #[test]
    fn test_nav_conflict_without_timestamps_uses_fixed_ordering() {
        let arbitrator = SourceArbitrator::new();
        let merged = arbitrator.merge_navs(vec![
            create_test_nav(Source::WealthMagik, Some(10.05), Some(9)),
            create_test_nav(Source::Finnomena, Some(10.00), Some(9)),
        ]);
        assert_eq!(merged[0].nav_value, Some(10.00));
        assert_eq!(merged[0].source, Source::Finnomena);

        let merged = arbitrator.merge_navs(vec![
            create_test_nav(Source::Finnomena, Some(10.00), None),
            create_test_nav(Source::WealthMagik, Some(10.05), Some(10)),
        ]);
        assert_eq!(merged[0].nav_value, Some(10.00));
    }

    #[test]
    fn test_nav_nulls_and_agreement_are_coalesced() {
        let arbitrator = SourceArbitrator::new();
        let mut fn_row = create_test_nav(Source::Finnomena, Some(12.3456), Some(11));
        fn_row.aum = None;
        let mut wm_row = create_test_nav(Source::WealthMagik, Some(12.34565), Some(8));
        wm_row.aum = Some(1_500_000_000.0);
        wm_row.bid = Some(12.30);

        let merged = arbitrator.merge_navs(vec![fn_row, wm_row]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].nav_value, Some(12.3456), "agreeing values keep the first source");
        assert_eq!(merged[0].aum, Some(1_500_000_000.0));
        assert_eq!(merged[0].bid, Some(12.30));
        assert_eq!(merged[0].source, Source::Finnomena);
        assert_eq!(merged[0].scraped_at, Some(at(11)));
    }

    #[test]
    fn test_single_source_entity_is_returned_unchanged() {
        let arbitrator = SourceArbitrator::new();
        let fee = create_test_fee(Source::Finnomena, Some(date(2024, 5, 1)), 1.25);
        let chosen = arbitrator.arbitrate_entities(vec![fee.clone()]);
        assert_eq!(chosen, vec![fee]);
    }

    #[test]
    fn test_stale_default_loses_only_past_threshold() {
        let arbitrator = SourceArbitrator::new();
        let default_fee = create_test_fee(Source::Finnomena, Some(date(2024, 1, 1)), 1.25);

        // 61 days newer: alternate wins
        let fresh = create_test_fee(Source::WealthMagik, Some(date(2024, 3, 2)), 1.10);
        let chosen = arbitrator.arbitrate_entities(vec![default_fee.clone(), fresh.clone()]);
        assert_eq!(chosen, vec![fresh]);

        // 31 days newer: default kept
        let recent = create_test_fee(Source::WealthMagik, Some(date(2024, 2, 1)), 1.10);
        let chosen = arbitrator.arbitrate_entities(vec![default_fee.clone(), recent]);
        assert_eq!(chosen, vec![default_fee]);

        println!("✅ Stale default test PASSED");
    }

    #[test]
    fn test_missing_as_of_keeps_default() {
        let arbitrator = SourceArbitrator::new();
        let undated = create_test_fee(Source::Finnomena, None, 1.25);
        let dated = create_test_fee(Source::WealthMagik, Some(date(2024, 5, 1)), 1.10);
        let chosen = arbitrator.arbitrate_entities(vec![undated.clone(), dated]);
        assert_eq!(chosen, vec![undated]);
    }

    #[test]
    fn test_without_default_freshest_wins() {
        let arbitrator = SourceArbitrator::new();
        let mut freshness = BTreeMap::new();
        freshness.insert(Source::WealthMagik, Some(date(2024, 1, 1)));
        freshness.insert(Source::Sec, Some(date(2024, 1, 5)));
        assert_eq!(arbitrator.choose_source(&freshness), Some(Source::Sec));

        freshness.insert(Source::Sec, Some(date(2024, 1, 1)));
        assert_eq!(arbitrator.choose_source(&freshness), Some(Source::WealthMagik));
    }

    #[test]
    fn test_configured_default_source() {
        let arbitrator = SourceArbitrator::with_thresholds(Source::WealthMagik, 30, 0.001);
        let mut freshness = BTreeMap::new();
        freshness.insert(Source::Finnomena, Some(date(2024, 1, 20)));
        freshness.insert(Source::WealthMagik, Some(date(2024, 1, 1)));
        assert_eq!(arbitrator.choose_source(&freshness), Some(Source::WealthMagik));

        freshness.insert(Source::Finnomena, Some(date(2024, 2, 15)));
        assert_eq!(arbitrator.choose_source(&freshness), Some(Source::Finnomena));
    }

    #[test]
    fn test_codes_are_unioned() {
        let arbitrator = SourceArbitrator::new();
        let code = |code: &str, code_type: Option<&str>, source| CodeRecord {
            fund_code: "K-USA-A".to_string(),
            code: code.to_string(),
            code_type: code_type.map(str::to_string),
            source,
        };

        let merged = arbitrator.union_codes(vec![
            code("TH0000000001", None, Source::WealthMagik),
            code("TH0000000001", Some("isin"), Source::Sec),
            code("KUSAA TB", Some("bloomberg"), Source::Finnomena),
        ]);

        assert_eq!(merged.len(), 2);
        let isin = merged.iter().find(|c| c.code == "TH0000000001").unwrap();
        assert_eq!(isin.source, Source::WealthMagik);
        assert_eq!(isin.code_type.as_deref(), Some("isin"));
    }
}
