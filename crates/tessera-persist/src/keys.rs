//! Key layout for the flat persistence namespace.
//!
//! Every key lives under the reserved `tessera:` prefix. `k` is a query's
//! storage key or an entity key, both `u32`.

pub const PREFIX: &str = "tessera:";

pub fn value_key(k: u32) -> String {
    format!("{PREFIX}value:{k}")
}

pub fn updated_at_key(k: u32) -> String {
    format!("{PREFIX}updatedAt:{k}")
}

pub fn ref_ids_key(k: u32) -> String {
    format!("{PREFIX}refIds:{k}")
}

pub fn ref_count_key(k: u32) -> String {
    format!("{PREFIX}refCount:{k}")
}

pub fn stream_orphan_refs_key(k: u32) -> String {
    format!("{PREFIX}streamOrphanRefs:{k}")
}

pub fn optimistic_insert_refs_key(k: u32) -> String {
    format!("{PREFIX}optimisticInsertRefs:{k}")
}

pub fn queue_key(def_id: &str) -> String {
    format!("{PREFIX}queue:{def_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed_and_distinct() {
        assert_eq!(value_key(7), "tessera:value:7");
        assert_eq!(updated_at_key(7), "tessera:updatedAt:7");
        assert_eq!(queue_key("users"), "tessera:queue:users");
        assert_ne!(ref_ids_key(7), ref_count_key(7));
    }
}
