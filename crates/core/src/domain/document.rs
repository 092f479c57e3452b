use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde_yaml::Value;
use thiserror::Error;

use super::task::{NewTask, Priority, TaskDocument, TaskMetadata, TaskType, Team};

/// Maximum length of the slug segment of a task filename.
const SLUG_MAX: usize = 50;

const DELIMITER: &str = "---";

#[derive(Debug, Error)]
pub enum ParseError {
  #[error("missing front matter start delimiter '---'")]
  StartDelimiterMissing,
  #[error("missing front matter end delimiter '---'")]
  EndDelimiterMissing,
  #[error("invalid task metadata: {0}")]
  Metadata(String),
  #[error("{}: {source}", path.display())]
  InFile {
    path: PathBuf,
    #[source]
    source: Box<ParseError>,
  },
}

#[derive(Debug, Error)]
pub enum SerializeError {
  #[error("invalid task document ({}): {reason}", task_id.as_deref().unwrap_or("unknown id"))]
  Invalid {
    task_id: Option<String>,
    reason: String,
  },
  #[error("yaml rendering failed for task {task_id}: {source}")]
  Yaml {
    task_id: String,
    #[source]
    source: serde_yaml::Error,
  },
}

/// Outcome of non-throwing validation.
#[derive(Debug, Clone)]
pub struct ValidationReport {
  pub valid: bool,
  pub errors: Vec<String>,
}

/// Check a document without failing. Serialization refuses documents that
/// do not pass.
pub fn validate(doc: &TaskDocument) -> ValidationReport {
  let mut errors = Vec::new();
  if doc.metadata.id.trim().is_empty() {
    errors.push("id: must not be empty".to_string());
  } else if doc.metadata.id.chars().any(char::is_whitespace) {
    errors.push("id: must not contain whitespace".to_string());
  }
  if doc.metadata.title.trim().is_empty() {
    errors.push("title: must not be empty".to_string());
  }
  for (i, dep) in doc.metadata.dependencies.iter().enumerate() {
    if dep.task_id.trim().is_empty() {
      errors.push(format!("dependencies[{i}].taskId: must not be empty"));
    }
  }
  ValidationReport {
    valid: errors.is_empty(),
    errors,
  }
}

/// Serialize a document to its on-disk text form: a key-sorted YAML
/// frontmatter block between `---` lines, a blank line, then the body.
pub fn to_markdown(doc: &TaskDocument) -> Result<String, SerializeError> {
  let report = validate(doc);
  if !report.valid {
    return Err(SerializeError::Invalid {
      task_id: Some(doc.metadata.id.clone()),
      reason: report.errors.join("; "),
    });
  }
  let value = serde_yaml::to_value(&doc.metadata).map_err(|source| SerializeError::Yaml {
    task_id: doc.metadata.id.clone(),
    source,
  })?;
  let yaml = serde_yaml::to_string(&sort_keys(value)).map_err(|source| SerializeError::Yaml {
    task_id: doc.metadata.id.clone(),
    source,
  })?;
  let mut s = String::new();
  s.push_str(DELIMITER);
  s.push('\n');
  s.push_str(&yaml);
  s.push_str(DELIMITER);
  s.push_str("\n\n");
  s.push_str(&doc.content);
  if !doc.content.ends_with('\n') {
    s.push('\n');
  }
  Ok(s)
}

/// Parse the on-disk text form back into a document. The first line must be
/// the delimiter; the closing delimiter is located by scanning forward.
/// `path` is attached to any error for context.
pub fn from_markdown(text: &str, path: Option<&Path>) -> Result<TaskDocument, ParseError> {
  match parse_inner(text) {
    Ok(doc) => Ok(doc),
    Err(source) => match path {
      Some(p) => Err(ParseError::InFile {
        path: p.to_path_buf(),
        source: Box::new(source),
      }),
      None => Err(source),
    },
  }
}

fn parse_inner(text: &str) -> Result<TaskDocument, ParseError> {
  let mut lines = text.split_inclusive('\n');
  let first = lines.next().ok_or(ParseError::StartDelimiterMissing)?;
  if first.trim_end() != DELIMITER {
    return Err(ParseError::StartDelimiterMissing);
  }
  let rest = &text[first.len()..];

  // Scan line by line for the closing delimiter, tracking byte offsets.
  let mut yaml_end = None;
  let mut offset = 0usize;
  for line in rest.split_inclusive('\n') {
    if line.trim_end() == DELIMITER {
      yaml_end = Some((offset, offset + line.len()));
      break;
    }
    offset += line.len();
  }
  let (yaml_end, content_start) = yaml_end.ok_or(ParseError::EndDelimiterMissing)?;

  // Decode into a generic record first, then validate against the schema.
  let value: Value =
    serde_yaml::from_str(&rest[..yaml_end]).map_err(|e| ParseError::Metadata(e.to_string()))?;
  let metadata: TaskMetadata =
    serde_yaml::from_value(value).map_err(|e| ParseError::Metadata(e.to_string()))?;

  Ok(TaskDocument {
    metadata,
    content: rest[content_start..].trim().to_string(),
  })
}

/// Recursively sort mapping keys so rendering is deterministic.
fn sort_keys(value: Value) -> Value {
  match value {
    Value::Mapping(map) => {
      let mut entries: Vec<(Value, Value)> =
        map.into_iter().map(|(k, v)| (k, sort_keys(v))).collect();
      entries.sort_by(|(a, _), (b, _)| {
        a.as_str()
          .unwrap_or_default()
          .cmp(b.as_str().unwrap_or_default())
      });
      Value::Mapping(entries.into_iter().collect())
    }
    Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(sort_keys).collect()),
    other => other,
  }
}

/// Lowercase the title, fold every non-alphanumeric run into a single
/// hyphen, trim leading/trailing hyphens, and cap the length.
pub fn slugify(title: &str) -> String {
  let mut out = String::new();
  let mut pending_hyphen = false;
  for c in title.chars() {
    if out.len() >= SLUG_MAX {
      break;
    }
    if c.is_ascii_alphanumeric() {
      if pending_hyphen && !out.is_empty() {
        out.push('-');
      }
      pending_hyphen = false;
      out.push(c.to_ascii_lowercase());
    } else {
      pending_hyphen = true;
    }
  }
  out.truncate(SLUG_MAX);
  while out.ends_with('-') {
    out.pop();
  }
  out
}

/// `{priority}_{type}_{slug}_{id}.md`. The priority prefix lets the queue
/// engine order a backlog from names alone.
pub fn task_filename(doc: &TaskDocument) -> String {
  format!(
    "{}_{}_{}_{}.md",
    doc.metadata.priority.as_str(),
    doc.metadata.task_type.as_str(),
    slugify(&doc.metadata.title),
    doc.metadata.id
  )
}

fn filename_regex() -> &'static Regex {
  static RE: OnceLock<Regex> = OnceLock::new();
  RE.get_or_init(|| {
    Regex::new(r"^(critical|high|medium|low)_([a-z]+)_([a-z0-9-]*)_([0-9a-f][0-9a-f-]*)\.md$")
      .expect("valid regex")
  })
}

/// Recover the exact id segment from a task filename. Accepts a path or a
/// bare filename; returns None for names not produced by `task_filename`.
pub fn extract_task_id(filename: &str) -> Option<String> {
  let name = filename.rsplit('/').next().unwrap_or(filename);
  filename_regex().captures(name).map(|caps| caps[4].to_string())
}

/// Read the priority prefix off a task filename without opening the file.
pub fn priority_from_filename(filename: &str) -> Option<Priority> {
  let name = filename.rsplit('/').next().unwrap_or(filename);
  Priority::parse(name.split('_').next()?)
}

/// A human-editable scaffold for authoring a task by hand: frontmatter plus
/// empty section headers.
pub fn task_template(
  title: &str,
  task_type: TaskType,
  from: Team,
  to: Team,
) -> Result<String, SerializeError> {
  let mut input = NewTask::new(title, task_type, from, to);
  input.content = "## Description\n\n<!-- What needs to be done and why. -->\n\n## Acceptance Criteria\n\n- [ ] \n\n## Notes".to_string();
  let doc = TaskDocument::create(input).map_err(|e| SerializeError::Invalid {
    task_id: None,
    reason: e.to_string(),
  })?;
  to_markdown(&doc)
}

/// Result of parsing one file out of a batch.
#[derive(Debug)]
pub struct ParsedTaskFile {
  pub path: PathBuf,
  pub result: Result<TaskDocument, ParseError>,
}

/// Parse a batch of already-read files. One corrupt file never aborts the
/// batch; its error travels in its own entry.
pub fn parse_task_files<'a, I>(files: I) -> Vec<ParsedTaskFile>
where
  I: IntoIterator<Item = (PathBuf, &'a str)>,
{
  files
    .into_iter()
    .map(|(path, text)| {
      let result = from_markdown(text, Some(&path));
      ParsedTaskFile { path, result }
    })
    .collect()
}
