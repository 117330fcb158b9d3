pub mod follower;
pub mod utils;

use std::time::Duration;

use super::next_backoff;

#[test]
fn test_next_backoff() {
    let max = Duration::from_secs(300);
    assert_eq!(
        next_backoff(Duration::from_secs(5), max),
        Duration::from_secs(10)
    );
    assert_eq!(
        next_backoff(Duration::from_secs(200), max),
        Duration::from_secs(300)
    );
    assert_eq!(next_backoff(max, max), max);
}
