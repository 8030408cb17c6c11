//! Stream-id generation.
//!
//! Ids only need to be unique within a single session (spec §3,
//! invariant 1); a UUIDv4 gives that with no coordination required
//! between the endpoint that allocates it and the peer that echoes it
//! back.

use uuid::Uuid;

pub fn new_stream_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_across_many_calls() {
        let ids: HashSet<String> = (0..10_000).map(|_| new_stream_id()).collect();
        assert_eq!(ids.len(), 10_000);
    }
}
