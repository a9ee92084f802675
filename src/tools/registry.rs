//! 工具注册表
//!
//! 固定的任务工具目录：名称、描述（供后端理解）、参数 schema、破坏性分类，
//! 以及它包装的任务存储操作。破坏性分类可按配置覆盖。

use std::collections::BTreeMap;

use schemars::schema_for;
use serde::Serialize;
use serde_json::Value;

use crate::core::AgentError;
use crate::tools::schema::{
    AddTaskArgs, CompleteTaskArgs, DeleteTaskArgs, ListTasksArgs, TaskCommand, UpdateTaskArgs,
};

/// 工具包装的任务存储操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOperation {
    Create,
    List,
    Update,
    SetCompleted,
    Delete,
}

/// 单个工具的元数据
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// 破坏性工具需用户确认后才执行
    pub destructive: bool,
    pub operation: TaskOperation,
    pub parameters: Value,
}

/// 工具注册表：按名称有序存储
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolSpec>,
}

fn schema_value<T: schemars::JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or(Value::Null)
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置任务工具；默认只有 delete_task 属于破坏性操作
    pub fn with_task_tools() -> Self {
        let mut registry = Self::new();
        registry.register(ToolSpec {
            name: "add_task".into(),
            description: "Create a new task for the user. Requires a title; description and priority (low, medium, high) are optional.".into(),
            destructive: false,
            operation: TaskOperation::Create,
            parameters: schema_value::<AddTaskArgs>(),
        });
        registry.register(ToolSpec {
            name: "list_tasks".into(),
            description: "List the user's tasks, optionally filtered by status (all, pending, completed).".into(),
            destructive: false,
            operation: TaskOperation::List,
            parameters: schema_value::<ListTasksArgs>(),
        });
        registry.register(ToolSpec {
            name: "update_task".into(),
            description: "Change the title, description or priority of an existing task.".into(),
            destructive: false,
            operation: TaskOperation::Update,
            parameters: schema_value::<UpdateTaskArgs>(),
        });
        registry.register(ToolSpec {
            name: "complete_task".into(),
            description: "Mark a task as completed (or as not completed with completed=false).".into(),
            destructive: false,
            operation: TaskOperation::SetCompleted,
            parameters: schema_value::<CompleteTaskArgs>(),
        });
        registry.register(ToolSpec {
            name: "delete_task".into(),
            description: "Permanently delete a task. The user must confirm before it runs.".into(),
            destructive: true,
            operation: TaskOperation::Delete,
            parameters: schema_value::<DeleteTaskArgs>(),
        });
        registry
    }

    /// 按配置设置破坏性工具列表（列表外的工具一律视为安全）
    pub fn with_destructive(mut self, destructive: &[String]) -> Self {
        for (name, spec) in self.tools.iter_mut() {
            spec.destructive = destructive.iter().any(|d| d == name);
        }
        let unknown: Vec<&String> = destructive
            .iter()
            .filter(|d| !self.tools.contains_key(d.as_str()))
            .collect();
        if !unknown.is_empty() {
            tracing::warn!("Ignoring unknown destructive tools in config: {:?}", unknown);
        }
        self
    }

    pub fn register(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub fn is_destructive(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|t| t.destructive)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 查找并校验：未知工具 -> UnknownTool，参数不合法 -> Validation
    pub fn validate(&self, name: &str, arguments: &Value) -> Result<(&ToolSpec, TaskCommand), AgentError> {
        let spec = self
            .tools
            .get(name)
            .ok_or_else(|| AgentError::UnknownTool(name.to_string()))?;
        let command = TaskCommand::parse(name, arguments)?;
        Ok((spec, command))
    }

    /// 工具 schema JSON，拼入 system prompt
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .tools
            .values()
            .map(|tool| {
                serde_json::json!({
                    "name": tool.name,
                    "description": tool.description,
                    "destructive": tool.destructive,
                    "parameters": tool.parameters,
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_catalog() {
        let registry = ToolRegistry::with_task_tools();
        assert_eq!(
            registry.tool_names(),
            vec!["add_task", "complete_task", "delete_task", "list_tasks", "update_task"]
        );
        assert!(registry.is_destructive("delete_task"));
        assert!(!registry.is_destructive("complete_task"));
        assert!(!registry.is_destructive("nope"));
        assert_eq!(registry.get("complete_task").unwrap().operation, TaskOperation::SetCompleted);
    }

    #[test]
    fn test_destructive_is_configurable() {
        let registry = ToolRegistry::with_task_tools()
            .with_destructive(&["complete_task".to_string(), "delete_task".to_string()]);
        assert!(registry.is_destructive("complete_task"));
        assert!(registry.is_destructive("delete_task"));
        assert!(!registry.is_destructive("add_task"));

        let registry = ToolRegistry::with_task_tools().with_destructive(&[]);
        assert!(!registry.is_destructive("delete_task"));
    }

    #[test]
    fn test_validate() {
        let registry = ToolRegistry::with_task_tools();
        let (spec, _) = registry.validate("delete_task", &json!({"task_id": 7})).unwrap();
        assert!(spec.destructive);
        assert!(matches!(
            registry.validate("format_disk", &json!({})),
            Err(AgentError::UnknownTool(_))
        ));
        assert!(matches!(
            registry.validate("add_task", &json!({"title": ""})),
            Err(AgentError::Validation(_))
        ));
    }

    #[test]
    fn test_schema_json_contains_parameters() {
        let json = ToolRegistry::with_task_tools().to_schema_json();
        let parsed: Value = serde_json::from_str(&json).unwrap();
        let tools = parsed.as_array().unwrap();
        assert_eq!(tools.len(), 5);
        let add = tools.iter().find(|t| t["name"] == "add_task").unwrap();
        assert!(add["parameters"]["properties"]["title"].is_object());
        assert_eq!(add["destructive"], false);
    }
}
