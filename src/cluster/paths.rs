//! Repository key layout for cluster metadata and pipeline checkpoints.

use super::instance::InstanceType;

pub const COMPUTE_NODES_ROOT: &str = "/nodes/compute_nodes";
pub const ONLINE_ROOT: &str = "/nodes/compute_nodes/online";
pub const STATUS_ROOT: &str = "/nodes/compute_nodes/status";
pub const LABELS_ROOT: &str = "/nodes/compute_nodes/labels";
pub const WORKER_ID_ROOT: &str = "/nodes/compute_nodes/worker_id";
pub const KILL_PROCESS_TRIGGER_ROOT: &str = "/nodes/compute_nodes/kill_process_trigger";
pub const SHOW_PROCESS_LIST_TRIGGER_ROOT: &str = "/nodes/compute_nodes/show_process_list_trigger";
pub const EXECUTION_NODES_ROOT: &str = "/execution_nodes";
pub const RULES_ROOT: &str = "/rules";
pub const PROPS_ROOT: &str = "/props";
pub const PROPS_ACTIVE_VERSION: &str = "/props/active_version";
pub const METADATA_ROOT: &str = "/metadata";
pub const LISTENER_ASSISTED_ROOT: &str = "/states/listener_assisted";
pub const STATISTICS_ROOT: &str = "/statistics/databases";
pub const WORKER_ID_RESERVATION_ROOT: &str = "/reservation/worker_id";
pub const PIPELINE_JOBS_ROOT: &str = "/pipeline/jobs";

const ACTIVE_VERSION: &str = "active_version";
const VERSIONS: &str = "versions";

/// Segments of `key` below `root`, or None when `key` is not under `root`
fn segments_under<'a>(root: &str, key: &'a str) -> Option<Vec<&'a str>> {
    let rest = key.strip_prefix(root)?.strip_prefix('/')?;
    Some(rest.split('/').collect())
}

pub fn online_instance(instance_type: InstanceType, instance_id: &str) -> String {
    format!("{}/{}/{}", ONLINE_ROOT, instance_type.as_str(), instance_id)
}

/// Extract `(type, id)` from an online instance key
pub fn parse_online_instance(key: &str) -> Option<(InstanceType, String)> {
    match segments_under(ONLINE_ROOT, key)?.as_slice() {
        [instance_type, id] if !id.is_empty() => {
            Some((InstanceType::from_segment(instance_type)?, id.to_string()))
        }
        _ => None,
    }
}

pub fn instance_state(instance_id: &str) -> String {
    format!("{}/{}", STATUS_ROOT, instance_id)
}

pub fn instance_labels(instance_id: &str) -> String {
    format!("{}/{}", LABELS_ROOT, instance_id)
}

pub fn instance_worker_id(instance_id: &str) -> String {
    format!("{}/{}", WORKER_ID_ROOT, instance_id)
}

/// Instance id from a per-instance attribute key such as `<root>/<id>`
pub fn parse_instance_attribute(root: &str, key: &str) -> Option<String> {
    match segments_under(root, key)?.as_slice() {
        [id] if !id.is_empty() => Some(id.to_string()),
        _ => None,
    }
}

pub fn kill_process_trigger(instance_id: &str, process_id: &str) -> String {
    format!("{}/{}:{}", KILL_PROCESS_TRIGGER_ROOT, instance_id, process_id)
}

pub fn show_process_list_trigger(instance_id: &str, task_id: &str) -> String {
    format!("{}/{}:{}", SHOW_PROCESS_LIST_TRIGGER_ROOT, instance_id, task_id)
}

/// Extract `(instance id, operation id)` from a `<root>/<instance>:<id>` trigger key
pub fn parse_trigger(root: &str, key: &str) -> Option<(String, String)> {
    match segments_under(root, key)?.as_slice() {
        [node] => {
            let (instance_id, operation_id) = node.split_once(':')?;
            if instance_id.is_empty() || operation_id.is_empty() {
                return None;
            }
            Some((instance_id.to_string(), operation_id.to_string()))
        }
        _ => None,
    }
}

pub fn execution_nodes(task_id: &str) -> String {
    format!("{}/{}", EXECUTION_NODES_ROOT, task_id)
}

pub fn execution_node(task_id: &str, instance_id: &str) -> String {
    format!("{}/{}/{}", EXECUTION_NODES_ROOT, task_id, instance_id)
}

pub fn rule(name: &str) -> String {
    format!("{}/{}", RULES_ROOT, name)
}

pub fn rule_active_version(name: &str) -> String {
    format!("{}/{}/{}", RULES_ROOT, name, ACTIVE_VERSION)
}

pub fn rule_versions(name: &str) -> String {
    format!("{}/{}/{}", RULES_ROOT, name, VERSIONS)
}

pub fn rule_version(name: &str, version: u64) -> String {
    format!("{}/{}/{}/{}", RULES_ROOT, name, VERSIONS, version)
}

/// Rule name from `/rules/<name>/active_version`
pub fn parse_rule_active_version(key: &str) -> Option<String> {
    match segments_under(RULES_ROOT, key)?.as_slice() {
        [name, ACTIVE_VERSION] if !name.is_empty() => Some(name.to_string()),
        _ => None,
    }
}

pub fn props_versions() -> String {
    format!("{}/{}", PROPS_ROOT, VERSIONS)
}

pub fn props_version(version: u64) -> String {
    format!("{}/{}/{}", PROPS_ROOT, VERSIONS, version)
}

pub fn database(database: &str) -> String {
    format!("{}/{}", METADATA_ROOT, database)
}

pub fn schemas(database: &str) -> String {
    format!("{}/{}/schemas", METADATA_ROOT, database)
}

pub fn tables(database: &str, schema: &str) -> String {
    format!("{}/{}/schemas/{}/tables", METADATA_ROOT, database, schema)
}

pub fn table(database: &str, schema: &str, table: &str) -> String {
    format!("{}/{}/schemas/{}/tables/{}", METADATA_ROOT, database, schema, table)
}

pub fn table_active_version(database: &str, schema: &str, table_name: &str) -> String {
    format!("{}/{}", table(database, schema, table_name), ACTIVE_VERSION)
}

pub fn table_versions(database: &str, schema: &str, table_name: &str) -> String {
    format!("{}/{}", table(database, schema, table_name), VERSIONS)
}

pub fn table_version(database: &str, schema: &str, table_name: &str, version: u64) -> String {
    format!("{}/{}/{}", table(database, schema, table_name), VERSIONS, version)
}

/// A key below `/metadata/<db>/schemas/<schema>/tables/<table>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNode {
    pub database: String,
    pub schema: String,
    pub table: String,
    /// Whether the key is the table's `active_version` marker
    pub is_active_version: bool,
}

pub fn parse_table_node(key: &str) -> Option<TableNode> {
    let segments = segments_under(METADATA_ROOT, key)?;
    match segments.as_slice() {
        [database, "schemas", schema, "tables", table, rest @ ..]
            if !database.is_empty() && !schema.is_empty() && !table.is_empty() =>
        {
            Some(TableNode {
                database: database.to_string(),
                schema: schema.to_string(),
                table: table.to_string(),
                is_active_version: rest == [ACTIVE_VERSION],
            })
        }
        _ => None,
    }
}

pub fn listener_assisted(database: &str) -> String {
    format!("{}/{}", LISTENER_ASSISTED_ROOT, database)
}

/// Database name from a listener-assisted marker key
pub fn parse_listener_assisted(key: &str) -> Option<String> {
    parse_instance_attribute(LISTENER_ASSISTED_ROOT, key)
}

pub fn statistics_database(database: &str) -> String {
    format!("{}/{}", STATISTICS_ROOT, database)
}

pub fn statistics_schema(database: &str, schema: &str) -> String {
    format!("{}/{}/schemas/{}", STATISTICS_ROOT, database, schema)
}

pub fn statistics_table(database: &str, schema: &str, table: &str) -> String {
    format!("{}/{}/schemas/{}/tables/{}", STATISTICS_ROOT, database, schema, table)
}

pub fn statistics_row(database: &str, schema: &str, table: &str, unique_key: &str) -> String {
    format!("{}/{}", statistics_table(database, schema, table), unique_key)
}

/// Level of a statistics key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatisticsNode {
    Database(String),
    Schema(String, String),
    Table(String, String, String),
    Row {
        database: String,
        schema: String,
        table: String,
        unique_key: String,
    },
}

/// Classify a statistics key; structural keys such as `.../schemas` are None
pub fn parse_statistics(key: &str) -> Option<StatisticsNode> {
    let segments = segments_under(STATISTICS_ROOT, key)?;
    if segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    match segments.as_slice() {
        [database] => Some(StatisticsNode::Database(database.to_string())),
        [database, "schemas", schema] => {
            Some(StatisticsNode::Schema(database.to_string(), schema.to_string()))
        }
        [database, "schemas", schema, "tables", table] => Some(StatisticsNode::Table(
            database.to_string(),
            schema.to_string(),
            table.to_string(),
        )),
        [database, "schemas", schema, "tables", table, unique_key] => Some(StatisticsNode::Row {
            database: database.to_string(),
            schema: schema.to_string(),
            table: table.to_string(),
            unique_key: unique_key.to_string(),
        }),
        _ => None,
    }
}

pub fn worker_id_reservation(worker_id: i64) -> String {
    format!("{}/{}", WORKER_ID_RESERVATION_ROOT, worker_id)
}

pub fn job(job_id: &str) -> String {
    format!("{}/{}", PIPELINE_JOBS_ROOT, job_id)
}

/// Latest consistency check result of a job
pub fn job_check_result(job_id: &str) -> String {
    format!("{}/check/result", job(job_id))
}

/// Checkpoint root of one job item
pub fn job_item(job_id: &str, sharding_item: usize) -> String {
    format!("{}/{}/{}", PIPELINE_JOBS_ROOT, job_id, sharding_item)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_instance_roundtrip() {
        let key = online_instance(InstanceType::Jdbc, "app-1");
        assert_eq!(key, "/nodes/compute_nodes/online/jdbc/app-1");
        assert_eq!(
            parse_online_instance(&key),
            Some((InstanceType::Jdbc, "app-1".to_string()))
        );
        assert_eq!(parse_online_instance("/nodes/compute_nodes/online/jdbc"), None);
        assert_eq!(parse_online_instance("/nodes/compute_nodes/online/foo/x"), None);
    }

    #[test]
    fn test_parse_trigger() {
        let key = kill_process_trigger("proxy-1", "p-42");
        assert_eq!(
            parse_trigger(KILL_PROCESS_TRIGGER_ROOT, &key),
            Some(("proxy-1".to_string(), "p-42".to_string()))
        );
        assert_eq!(
            parse_trigger(KILL_PROCESS_TRIGGER_ROOT, "/nodes/compute_nodes/kill_process_trigger/bad"),
            None
        );
        assert_eq!(parse_trigger(SHOW_PROCESS_LIST_TRIGGER_ROOT, &key), None);
    }

    #[test]
    fn test_parse_rule_active_version() {
        assert_eq!(
            parse_rule_active_version("/rules/sharding/active_version"),
            Some("sharding".to_string())
        );
        assert_eq!(parse_rule_active_version("/rules/sharding/versions/0"), None);
    }

    #[test]
    fn test_parse_statistics_levels() {
        assert_eq!(
            parse_statistics("/statistics/databases/db"),
            Some(StatisticsNode::Database("db".into()))
        );
        assert_eq!(parse_statistics("/statistics/databases/db/schemas"), None);
        assert_eq!(
            parse_statistics(&statistics_row("db", "s", "t", "k1")),
            Some(StatisticsNode::Row {
                database: "db".into(),
                schema: "s".into(),
                table: "t".into(),
                unique_key: "k1".into(),
            })
        );
    }

    #[test]
    fn test_parse_table_node() {
        let node = parse_table_node(&table_active_version("db", "public", "t_order")).unwrap();
        assert!(node.is_active_version);
        assert_eq!(node.table, "t_order");

        let node = parse_table_node(&table_version("db", "public", "t_order", 3)).unwrap();
        assert!(!node.is_active_version);
        assert!(parse_table_node("/metadata/db/schemas/public").is_none());
    }
}
