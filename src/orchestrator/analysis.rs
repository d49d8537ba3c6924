//! Task complexity estimation

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::task::Task;

/// Output of a [`TaskAnalyzer`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityEstimate {
    /// In `[0, 1]`
    pub complexity: f64,
    /// Agents worth assigning per phase
    pub recommended_agents: usize,
    /// Expected wall-clock time
    #[serde(with = "humantime_serde")]
    pub estimated_duration: Duration,
}

/// Capacity/complexity analysis of a submitted task
#[async_trait]
pub trait TaskAnalyzer: Send + Sync {
    async fn analyze(&self, task: &Task) -> anyhow::Result<ComplexityEstimate>;
}

/// Scores a task by the size of its description and its capability and
/// dependency lists
#[derive(Debug, Clone)]
pub struct HeuristicAnalyzer {
    /// Duration of a task of zero complexity
    pub base_duration: Duration,
    /// Upper bound on `recommended_agents`
    pub max_agents: usize,
}

impl Default for HeuristicAnalyzer {
    fn default() -> Self {
        Self {
            base_duration: Duration::from_secs(60),
            max_agents: 4,
        }
    }
}

#[async_trait]
impl TaskAnalyzer for HeuristicAnalyzer {
    async fn analyze(&self, task: &Task) -> anyhow::Result<ComplexityEstimate> {
        let words = task.description.split_whitespace().count() as f64;
        let complexity = (0.4 * (words / 50.0).min(1.0)
            + 0.4 * (task.required_capabilities.len() as f64 / 5.0).min(1.0)
            + 0.2 * (task.dependencies.len() as f64 / 3.0).min(1.0))
        .clamp(0.0, 1.0);
        let span = self.max_agents.saturating_sub(1) as f64;
        let recommended_agents = (1.0 + (complexity * span).round()) as usize;
        Ok(ComplexityEstimate {
            complexity,
            recommended_agents: recommended_agents.clamp(1, self.max_agents.max(1)),
            estimated_duration: self.base_duration.mul_f64(1.0 + 4.0 * complexity),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simple_task_is_cheap() {
        let estimate = HeuristicAnalyzer::default()
            .analyze(&Task::new("fix typo"))
            .await
            .unwrap();
        assert!(estimate.complexity < 0.1);
        assert_eq!(estimate.recommended_agents, 1);
    }

    #[tokio::test]
    async fn test_rich_task_wants_more_agents() {
        let task = (0..3).fold(
            Task::new("word ".repeat(80)).requiring(["rust", "sql", "review", "docs", "ops"]),
            |t, _| t.depends_on(crate::types::TaskId::new()),
        );
        let estimate = HeuristicAnalyzer::default().analyze(&task).await.unwrap();
        assert!(estimate.complexity > 0.99);
        assert_eq!(estimate.recommended_agents, 4);
        assert!(estimate.estimated_duration > Duration::from_secs(200));
    }
}
