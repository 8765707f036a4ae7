/// Split `key` into the `/`-separated segments below `prefix`, dropping empty
/// segments. Returns `None` when the key is outside the prefix.
fn segments_below<'a>(prefix: &str, key: &'a str) -> Option<Vec<&'a str>> {
    let rest = key.strip_prefix(prefix)?;
    if !prefix.ends_with('/') && !rest.is_empty() && !rest.starts_with('/') {
        return None;
    }
    Some(rest.split('/').filter(|segment| !segment.is_empty()).collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPath<'a> {
    pub database: &'a str,
    pub table: &'a str,
    pub shard_id: &'a str,
}

/// Parse `<prefix>/<database>/<table>/<shardId>`.
pub fn parse_shard_path<'a>(prefix: &str, key: &'a str) -> Option<ShardPath<'a>> {
    match segments_below(prefix, key)?.as_slice() {
        &[database, table, shard_id, ..] => Some(ShardPath {
            database,
            table,
            shard_id,
        }),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePath<'a> {
    pub cluster_id: &'a str,
    pub node_id: &'a str,
}

/// Parse `<prefix>/<clusterId>/<nodeId>`.
pub fn parse_node_path<'a>(prefix: &str, key: &'a str) -> Option<NodePath<'a>> {
    match segments_below(prefix, key)?.as_slice() {
        &[cluster_id, node_id, ..] => Some(NodePath {
            cluster_id,
            node_id,
        }),
        _ => None,
    }
}
