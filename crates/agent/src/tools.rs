//! Built-in tools: long-term memory CRUD and task delegation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use krait_core::error::{RunnerError, ToolError};
use krait_core::tool::{Tool, ToolResult};
use krait_runner::TaskRunner;
use krait_store::Store;

fn required_str(args: &Value, key: &str) -> Result<String, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing required field '{key}'")))
}

// --- Memory tools ---

pub struct MemoryAddTool {
    store: Arc<dyn Store>,
}

#[async_trait]
impl Tool for MemoryAddTool {
    fn name(&self) -> &str {
        "memory_add"
    }

    fn description(&self) -> &str {
        "Save a durable fact to long-term memory."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "The fact to remember." }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult, ToolError> {
        let text = required_str(&args, "text")?;
        match self.store.memory_add(&text).await {
            Ok(id) => Ok(ToolResult::ok(format!("Remembered (id {id})."))),
            Err(e) => Ok(ToolResult::err(format!("Could not save memory: {e}"))),
        }
    }
}

pub struct MemorySearchTool {
    store: Arc<dyn Store>,
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search long-term memory by keyword."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Keywords to search for." },
                "limit": { "type": "integer", "description": "Max results, default 5." }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult, ToolError> {
        let query = required_str(&args, "query")?;
        let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(5) as usize;
        match self.store.memory_search(&query, limit).await {
            Ok(hits) if hits.is_empty() => Ok(ToolResult::ok("No matching memories.")),
            Ok(hits) => {
                let lines: Vec<String> = hits
                    .iter()
                    .map(|m| format!("[{}] {}", m.id, m.text))
                    .collect();
                Ok(ToolResult::ok(lines.join("\n")))
            }
            Err(e) => Ok(ToolResult::err(format!("Memory search failed: {e}"))),
        }
    }
}

pub struct MemoryListTool {
    store: Arc<dyn Store>,
}

#[async_trait]
impl Tool for MemoryListTool {
    fn name(&self) -> &str {
        "memory_list"
    }

    fn description(&self) -> &str {
        "List recent long-term memories."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": { "type": "integer", "description": "Max results, default 20." }
            }
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult, ToolError> {
        let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(20) as usize;
        match self.store.memory_list(limit).await {
            Ok(rows) if rows.is_empty() => Ok(ToolResult::ok("No memories stored.")),
            Ok(rows) => {
                let lines: Vec<String> = rows
                    .iter()
                    .map(|m| format!("[{}] {}", m.id, m.text))
                    .collect();
                Ok(ToolResult::ok(lines.join("\n")))
            }
            Err(e) => Ok(ToolResult::err(format!("Memory list failed: {e}"))),
        }
    }
}

pub struct MemoryDeleteTool {
    store: Arc<dyn Store>,
}

#[async_trait]
impl Tool for MemoryDeleteTool {
    fn name(&self) -> &str {
        "memory_delete"
    }

    fn description(&self) -> &str {
        "Delete a long-term memory by id."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "integer", "description": "Memory id to delete." }
            },
            "required": ["id"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult, ToolError> {
        let id = args
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| ToolError::InvalidArguments("missing required field 'id'".into()))?;
        match self.store.memory_delete(id).await {
            Ok(true) => Ok(ToolResult::ok(format!("Deleted memory {id}."))),
            Ok(false) => Ok(ToolResult::err(format!("No memory with id {id}."))),
            Err(e) => Ok(ToolResult::err(format!("Memory delete failed: {e}"))),
        }
    }
}

/// The four memory tools over a shared store.
pub fn memory_tools(store: Arc<dyn Store>) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(MemoryAddTool {
            store: Arc::clone(&store),
        }),
        Arc::new(MemorySearchTool {
            store: Arc::clone(&store),
        }),
        Arc::new(MemoryListTool {
            store: Arc::clone(&store),
        }),
        Arc::new(MemoryDeleteTool { store }),
    ]
}

// --- Task delegation ---

/// Per-chat state the delegate tool needs: which session the run
/// belongs to and the token that cancels it.
#[derive(Clone)]
pub struct DelegateContext {
    pub session_id: Option<i64>,
    pub cancel: CancellationToken,
}

impl Default for DelegateContext {
    fn default() -> Self {
        Self {
            session_id: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Hands a task description to a configured CLI runner and relays the
/// structured outcome back to the model.
pub struct DelegateTaskTool {
    runners: BTreeMap<String, Arc<TaskRunner>>,
    workspace_dir: PathBuf,
    ctx: Arc<StdMutex<DelegateContext>>,
    description: String,
}

impl DelegateTaskTool {
    pub fn new(
        runners: BTreeMap<String, Arc<TaskRunner>>,
        workspace_dir: PathBuf,
        ctx: Arc<StdMutex<DelegateContext>>,
    ) -> Self {
        let names: Vec<&str> = runners.keys().map(String::as_str).collect();
        let description = format!(
            "Delegate a self-contained task to a coding CLI. Available runners: {}. \
             The task runs in its own directory and the result includes exit status \
             and captured output.",
            names.join(", ")
        );
        Self {
            runners,
            workspace_dir,
            ctx,
            description,
        }
    }

    /// True while any runner has a child process alive.
    pub fn is_running(&self) -> bool {
        self.runners.values().any(|r| r.is_running())
    }

    /// Kill whichever runner is active. No-op when idle.
    pub fn kill_active(&self) {
        for runner in self.runners.values() {
            runner.kill();
        }
    }

    fn context(&self) -> DelegateContext {
        match self.ctx.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn run_dir(&self, session_id: Option<i64>, runner: &str) -> PathBuf {
        let sanitized: String = runner
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let ts = Utc::now().format("%Y%m%d_%H%M%S");
        let uid = Uuid::new_v4().simple().to_string();
        self.workspace_dir.join("tasks").join(format!(
            "s{}_{}_{}_{}",
            session_id.unwrap_or(0),
            sanitized,
            ts,
            &uid[..6]
        ))
    }
}

#[async_trait]
impl Tool for DelegateTaskTool {
    fn name(&self) -> &str {
        "delegate_task"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        let names: Vec<&str> = self.runners.keys().map(String::as_str).collect();
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Full self-contained task description."
                },
                "runner": {
                    "type": "string",
                    "enum": names,
                    "description": "Which runner to use. Defaults to the first one."
                },
                "cwd": {
                    "type": "string",
                    "description": "Working directory override. A fresh task directory is created when omitted."
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolResult, ToolError> {
        let task = required_str(&args, "task")?;
        let runner_name = args
            .get("runner")
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| self.runners.keys().next().cloned());
        let runner_name = match runner_name {
            Some(name) => name,
            None => {
                return Ok(ToolResult::err(
                    json!({ "ok": false, "error": "no runners configured" }).to_string(),
                ))
            }
        };
        let runner = match self.runners.get(&runner_name) {
            Some(runner) => Arc::clone(runner),
            None => {
                return Ok(ToolResult::err(
                    json!({
                        "ok": false,
                        "error": format!("unknown runner '{runner_name}'"),
                    })
                    .to_string(),
                ))
            }
        };

        let ctx = self.context();
        let cwd = match args.get("cwd").and_then(Value::as_str) {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => self.run_dir(ctx.session_id, &runner_name),
        };
        info!(runner = %runner_name, cwd = %cwd.display(), "delegating task");

        match runner.run(&task, &cwd, &ctx.cancel).await {
            Ok(outcome) => {
                let output = outcome.to_json();
                if outcome.ok {
                    Ok(ToolResult::ok(output))
                } else {
                    Ok(ToolResult::err(output))
                }
            }
            Err(RunnerError::Cancelled) => Err(ToolError::Cancelled),
            Err(e) => Ok(ToolResult::err(
                json!({ "ok": false, "error": e.to_string() }).to_string(),
            )),
        }
    }
}
