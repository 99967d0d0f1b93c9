/// Split a sorted sequence of integers into runs of consecutive values,
/// each reported as `(first, last)`.
///
/// `[1, 2, 3, 7, 8, 10]` gives `[(1, 3), (7, 8), (10, 10)]`. Repeated values
/// stay in the current run.
pub fn find_subranges(values: &[u64]) -> Vec<(u64, u64)> {
    let mut ranges: Vec<(u64, u64)> = Vec::new();
    for &v in values {
        if let Some((_, last)) = ranges.last_mut() {
            if v == *last || Some(v) == last.checked_add(1) {
                *last = v;
                continue;
            }
        }
        ranges.push((v, v));
    }
    ranges
}
