/// Decides whether an event with a 1-in-`ratio` sampling ratio is kept.
///
/// A ratio of 1 always keeps the event and 0 always discards it.
pub fn should_sample(ratio: u64) -> bool {
    match ratio {
        0 => false,
        1 => true,
        // Zero is inside every range, so this hits roughly once per `ratio` draws.
        _ => fastrand::u64(0..ratio) == 0,
    }
}
