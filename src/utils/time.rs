use chrono::NaiveDate;

/// This is the standard way of naming a day's record file in focustally.
pub fn date_to_record_name(date: NaiveDate) -> String {
    format!("{}.jsonl", date.format("%Y-%m-%d"))
}

/// Iterates every date from start to end, both inclusive. An inverted range yields
/// nothing.
pub fn dates_inclusive(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    std::iter::successors(Some(start), |current| current.succ_opt())
        .take_while(move |current| *current <= end)
}
