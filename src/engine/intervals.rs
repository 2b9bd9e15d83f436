use chrono::{DateTime, Duration, Utc};

/// Computes true elapsed active time from spans that may overlap, for example when
/// the same timeframe was sampled into several records. Overlapping spans are
/// collapsed into disjoint ones before summing, so nothing is counted twice.
///
/// Zero and negative spans are discarded. Empty input yields zero.
pub fn merged_active_time(mut spans: Vec<(DateTime<Utc>, DateTime<Utc>)>) -> Duration {
    spans.retain(|(start, end)| end > start);
    spans.sort_by_key(|(start, _)| *start);

    let mut total = Duration::zero();
    let mut merged: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
    for (start, end) in spans {
        match merged {
            Some((merged_start, merged_end)) if start <= merged_end => {
                merged = Some((merged_start, merged_end.max(end)));
            }
            Some((merged_start, merged_end)) => {
                total = total + (merged_end - merged_start);
                merged = Some((start, end));
            }
            None => merged = Some((start, end)),
        }
    }
    if let Some((merged_start, merged_end)) = merged {
        total = total + (merged_end - merged_start);
    }
    total
}
