//! Pipeline execution records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses only move forward; terminal statuses are final.
    pub fn can_transition_to(&self, target: ExecutionStatus) -> bool {
        match (self, target) {
            (a, b) if *a == b => !a.is_terminal(),
            (ExecutionStatus::Pending, _) => true,
            (ExecutionStatus::Running, ExecutionStatus::Pending) => false,
            (ExecutionStatus::Running, _) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn can_transition_to(&self, target: StepStatus) -> bool {
        match (self, target) {
            (a, b) if *a == b => !a.is_terminal(),
            (StepStatus::Pending, _) => true,
            (StepStatus::Running, StepStatus::Completed | StepStatus::Failed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(format!("unknown step status '{}'", other)),
        }
    }
}

/// Where an execution stands, with the approval pause made explicit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionPhase {
    Pending,
    Running,
    /// Paused at an approval gate until resumed by token
    Suspended { resume_token: String },
    Finished(ExecutionStatus),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineExecution {
    pub id: String,
    pub pipeline_name: String,
    pub project_id: String,
    pub status: ExecutionStatus,
    pub inputs_json: String,
    pub outputs_json: Option<String>,
    pub resume_token: Option<String>,
    pub session_id: Option<String>,
    pub parent_execution_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineExecution {
    pub fn new(pipeline_name: &str, project_id: &str, inputs: &Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("pe-{}", Uuid::new_v4()),
            pipeline_name: pipeline_name.to_string(),
            project_id: project_id.to_string(),
            status: ExecutionStatus::Pending,
            inputs_json: Value::Object(inputs.clone()).to_string(),
            outputs_json: None,
            resume_token: None,
            session_id: None,
            parent_execution_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn phase(&self) -> ExecutionPhase {
        match (self.status, &self.resume_token) {
            (ExecutionStatus::Pending, _) => ExecutionPhase::Pending,
            (ExecutionStatus::Running, Some(token)) => ExecutionPhase::Suspended {
                resume_token: token.clone(),
            },
            (ExecutionStatus::Running, None) => ExecutionPhase::Running,
            (status, _) => ExecutionPhase::Finished(status),
        }
    }

    pub fn inputs(&self) -> Map<String, Value> {
        match serde_json::from_str(&self.inputs_json) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    pub fn outputs(&self) -> Value {
        self.outputs_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub execution_id: String,
    pub step_id: String,
    pub status: StepStatus,
    pub input: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub approval_token: Option<String>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    pub fn new(execution_id: &str, step_id: &str) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            step_id: step_id.to_string(),
            status: StepStatus::Pending,
            input: None,
            output: None,
            error: None,
            approval_token: None,
            approved_by: None,
            approved_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Waiting at an approval gate: body ran, token issued, not yet decided.
    pub fn awaiting_approval(&self) -> bool {
        self.status == StepStatus::Running && self.approval_token.is_some() && self.approved_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_transitions() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn test_step_transitions() {
        use StepStatus::*;
        assert!(Pending.can_transition_to(Skipped));
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Skipped));
        assert!(!Completed.can_transition_to(Running));
    }

    #[test]
    fn test_phase() {
        let mut exec = PipelineExecution::new("p", "proj", &Map::new());
        assert_eq!(exec.phase(), ExecutionPhase::Pending);

        exec.status = ExecutionStatus::Running;
        assert_eq!(exec.phase(), ExecutionPhase::Running);

        exec.resume_token = Some("tok".to_string());
        assert_eq!(
            exec.phase(),
            ExecutionPhase::Suspended {
                resume_token: "tok".to_string()
            }
        );

        exec.status = ExecutionStatus::Completed;
        exec.resume_token = None;
        assert_eq!(exec.phase(), ExecutionPhase::Finished(ExecutionStatus::Completed));
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [StepStatus::Pending, StepStatus::Skipped, StepStatus::Failed] {
            assert_eq!(status.as_str().parse::<StepStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<ExecutionStatus>().is_err());
    }
}
