//! Question graph: the branching structure a survey session walks.
//!
//! Question content is external; this module owns the shape of the graph
//! and the transition rule (current question + selected option → next
//! question id), terminating at the `end` sentinel.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Terminal sentinel: an edge pointing here ends the survey.
pub const END_NODE: &str = "end";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QuestionKind {
  SingleChoice,
  FreeText,
  Commune,
  Street,
  Gare,
}

/// One selectable answer, with the id of the question it leads to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
  pub id: u32,
  pub text: String,
  pub next: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
  pub id: String,
  pub text: String,
  #[serde(rename = "type")]
  pub kind: QuestionKind,
  #[serde(default)]
  pub options: Vec<Choice>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub next: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub image: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub image_alt: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub free_text_placeholder: Option<String>,
}

/// The survey's directed graph. The first listed question is the entry
/// point; edges are selected-option-to-next-id transitions.
pub struct QuestionGraph {
  questions: Vec<Question>,
  index: HashMap<String, usize>,
}

impl QuestionGraph {
  pub fn from_json(data: &[u8]) -> Result<Self> {
    let questions: Vec<Question> =
      serde_json::from_slice(data).map_err(|e| eyre!("Failed to parse question graph: {}", e))?;

    let mut index = HashMap::new();
    for (position, question) in questions.iter().enumerate() {
      if index.insert(question.id.clone(), position).is_some() {
        return Err(eyre!("Duplicate question id: {}", question.id));
      }
    }

    Ok(Self { questions, index })
  }

  pub fn load(path: &Path) -> Result<Self> {
    let data = std::fs::read(path)
      .map_err(|e| eyre!("Failed to read question graph {}: {}", path.display(), e))?;
    Self::from_json(&data)
  }

  pub fn first(&self) -> Option<&Question> {
    self.questions.first()
  }

  pub fn get(&self, id: &str) -> Option<&Question> {
    self.index.get(id).map(|&i| &self.questions[i])
  }

  pub fn is_end(id: &str) -> bool {
    id == END_NODE
  }

  /// Next question id for the current question and, for single-choice
  /// questions, the selected option.
  pub fn next_id(&self, current: &str, selected_option: Option<u32>) -> Result<String> {
    let question = self
      .get(current)
      .ok_or_else(|| eyre!("Unknown question id: {}", current))?;

    match question.kind {
      QuestionKind::SingleChoice => {
        let option =
          selected_option.ok_or_else(|| eyre!("Question {} requires a selected option", current))?;
        question
          .options
          .iter()
          .find(|c| c.id == option)
          .map(|c| c.next.clone())
          .ok_or_else(|| eyre!("Question {} has no option {}", current, option))
      }
      _ => question
        .next
        .clone()
        .ok_or_else(|| eyre!("Question {} has no next question", current)),
    }
  }

  /// Structural problems in the graph: edges that resolve to nothing,
  /// single-choice questions without options, other kinds without `next`.
  /// An empty list means the graph is sound.
  pub fn validate(&self) -> Vec<String> {
    let mut issues = Vec::new();

    if self.questions.is_empty() {
      issues.push("Question graph is empty".to_string());
    }

    for question in &self.questions {
      match question.kind {
        QuestionKind::SingleChoice => {
          if question.options.is_empty() {
            issues.push(format!("Question {} has no options", question.id));
          }
          for choice in &question.options {
            if !self.resolves(&choice.next) {
              issues.push(format!(
                "Question {} option {} points to unknown question {}",
                question.id, choice.id, choice.next
              ));
            }
          }
        }
        _ => match &question.next {
          Some(next) => {
            if !self.resolves(next) {
              issues.push(format!(
                "Question {} points to unknown question {}",
                question.id, next
              ));
            }
          }
          None => issues.push(format!("Question {} has no next question", question.id)),
        },
      }
    }

    issues
  }

  fn resolves(&self, id: &str) -> bool {
    Self::is_end(id) || self.index.contains_key(id)
  }
}
