//! 工具参数 Schema 与校验
//!
//! 后端提议的参数形状不可信：先剥离 user_id 类字段，再按工具反序列化为强类型的
//! TaskCommand（未知字段即报错），校验通过后才进入后续流程。
//! 参数 Schema 由 schemars 生成，注入 system prompt。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::core::AgentError;
use crate::tools::task_store::{Priority, TaskFilter};

const MAX_TITLE_CHARS: usize = 200;
const USER_ID_KEYS: [&str; 3] = ["user_id", "userId", "userid"];

/// add_task 参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct AddTaskArgs {
    /// 任务标题（1-200 字符）
    pub title: String,
    /// 可选描述
    #[serde(default)]
    pub description: Option<String>,
    /// low / medium / high，默认 medium
    #[serde(default)]
    pub priority: Option<Priority>,
}

/// list_tasks 参数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ListTasksArgs {
    /// all / pending / completed，默认 all
    #[serde(default)]
    pub status: Option<TaskFilter>,
}

/// update_task 参数：至少提供一个待修改字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdateTaskArgs {
    pub task_id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

/// complete_task 参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CompleteTaskArgs {
    pub task_id: i64,
    /// 默认 true；false 表示重新标记为未完成
    #[serde(default)]
    pub completed: Option<bool>,
}

/// delete_task 参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DeleteTaskArgs {
    pub task_id: i64,
}

/// 校验后的工具调用（tagged union）
#[derive(Debug, Clone, PartialEq)]
pub enum TaskCommand {
    Add(AddTaskArgs),
    List(ListTasksArgs),
    Update(UpdateTaskArgs),
    Complete(CompleteTaskArgs),
    Delete(DeleteTaskArgs),
}

impl TaskCommand {
    /// 按工具名解析并校验参数；arguments 需已剥离 user_id
    pub fn parse(tool_name: &str, arguments: &Value) -> Result<Self, AgentError> {
        let command = match tool_name {
            "add_task" => TaskCommand::Add(decode(tool_name, arguments)?),
            "list_tasks" => TaskCommand::List(decode(tool_name, arguments)?),
            "update_task" => TaskCommand::Update(decode(tool_name, arguments)?),
            "complete_task" => TaskCommand::Complete(decode(tool_name, arguments)?),
            "delete_task" => TaskCommand::Delete(decode(tool_name, arguments)?),
            other => return Err(AgentError::UnknownTool(other.to_string())),
        };
        command.check()?;
        Ok(command)
    }

    pub fn tool_name(&self) -> &'static str {
        match self {
            TaskCommand::Add(_) => "add_task",
            TaskCommand::List(_) => "list_tasks",
            TaskCommand::Update(_) => "update_task",
            TaskCommand::Complete(_) => "complete_task",
            TaskCommand::Delete(_) => "delete_task",
        }
    }

    fn check(&self) -> Result<(), AgentError> {
        match self {
            TaskCommand::Add(args) => check_title(&args.title),
            TaskCommand::List(_) => Ok(()),
            TaskCommand::Update(args) => {
                check_task_id(args.task_id)?;
                if args.title.is_none() && args.description.is_none() && args.priority.is_none() {
                    return Err(AgentError::Validation(
                        "update_task requires at least one of title, description, priority"
                            .to_string(),
                    ));
                }
                match &args.title {
                    Some(title) => check_title(title),
                    None => Ok(()),
                }
            }
            TaskCommand::Complete(args) => check_task_id(args.task_id),
            TaskCommand::Delete(args) => check_task_id(args.task_id),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(tool_name: &str, arguments: &Value) -> Result<T, AgentError> {
    serde_json::from_value(arguments.clone())
        .map_err(|e| AgentError::Validation(format!("invalid arguments for {}: {}", tool_name, e)))
}

fn check_title(title: &str) -> Result<(), AgentError> {
    let len = title.trim().chars().count();
    if len == 0 || len > MAX_TITLE_CHARS {
        return Err(AgentError::Validation(format!(
            "title must be 1-{} characters",
            MAX_TITLE_CHARS
        )));
    }
    Ok(())
}

fn check_task_id(task_id: i64) -> Result<(), AgentError> {
    if task_id <= 0 {
        return Err(AgentError::Validation(format!(
            "task_id must be a positive integer, got {}",
            task_id
        )));
    }
    Ok(())
}

/// 剥离 user_id 类字段；null 视为空对象，其余非对象值报错
pub fn sanitize_arguments(arguments: &Value) -> Result<Value, AgentError> {
    match arguments {
        Value::Null => Ok(Value::Object(Default::default())),
        Value::Object(map) => {
            let cleaned = map
                .iter()
                .filter(|(k, _)| !USER_ID_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Ok(Value::Object(cleaned))
        }
        other => Err(AgentError::Validation(format!(
            "tool arguments must be a JSON object, got {}",
            other
        ))),
    }
}

/// 规范化 JSON：对象键递归排序
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

/// 待确认去重键：sha256(user_id, tool_name, 规范化参数)
pub fn arguments_hash(user_id: &str, tool_name: &str, arguments: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(tool_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(arguments).as_bytes());
    hex::encode(hasher.finalize())
}
