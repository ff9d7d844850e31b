// `sql:query` — session-backed, resource type `sql`.
//
// No backend is registered for `sql` (see `register_reference_tools`),
// so the session router's `get_or_create` falls into its "no registered
// initializer" branch and returns a `compatibility_mode=true` session —
// this backend exists purely to demonstrate that path and
// `dependency-failure` on a malformed query, not to own real per-session
// state. The table itself is a fixed in-memory key-table shared process-wide.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::error::{ErrorKind, ToolError};
use crate::registry::{fn_tool, ContextNeeds, RegistrationError, ToolRegistry};

type Table = HashMap<String, Value>;

fn table() -> &'static Mutex<Table> {
    static TABLE: OnceLock<Mutex<Table>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut rows = HashMap::new();
        rows.insert("widgets".to_string(), json!({"count": 42, "color": "blue"}));
        rows.insert("gadgets".to_string(), json!({"count": 7, "color": "red"}));
        Mutex::new(rows)
    })
}

pub struct SqlBackend;

impl SqlBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SqlBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts only `SELECT * FROM <table>`, case-insensitively — anything
/// else is a malformed query and reported as `dependency-failure`.
fn parse_select_table(query: &str) -> Option<String> {
    let lower = query.trim().to_lowercase();
    let prefix = "select * from ";
    lower.strip_prefix(prefix).map(|rest| rest.trim().trim_end_matches(';').to_string())
}

impl SqlBackend {
    pub fn register_tools(self: &Arc<Self>, reg: &mut ToolRegistry) -> Result<(), RegistrationError> {
        reg.register(
            "sql:query",
            None,
            "Read a row from the in-memory key-table",
            ContextNeeds::NONE,
            fn_tool(|params, _ctx| async move {
                let query = params
                    .get("query")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ToolError::new(ErrorKind::MissingRequiredField, "missing required field: query"))?;

                let table_name = parse_select_table(query).ok_or_else(|| {
                    ToolError::new(ErrorKind::DependencyFailure, format!("malformed query: {query}"))
                })?;

                let rows = table().lock().await;
                match rows.get(&table_name) {
                    Some(row) => Ok(json!({ "table": table_name, "row": row })),
                    None => Err(ToolError::from_kind(ErrorKind::NoResultsFound)),
                }
            }),
        )?;
        Ok(())
    }
}
