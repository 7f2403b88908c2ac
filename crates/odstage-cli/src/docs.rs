//! Markdown rendering of a project's models and their checks.

use std::fmt::Write as _;

use odstage_core::{
  model::ModelDef,
  value::DataType,
};

fn type_name(t: DataType) -> &'static str {
  match t {
    DataType::Integer => "integer",
    DataType::Float => "float",
    DataType::Text => "text",
    DataType::Boolean => "boolean",
    DataType::Date => "date",
    DataType::Timestamp => "timestamp",
  }
}

/// Render one markdown section per model.
pub fn render(models: &[&ModelDef]) -> anyhow::Result<String> {
  let mut out = String::from("# Staging models\n");
  for model in models {
    render_model(&mut out, model)?;
  }
  Ok(out)
}

fn render_model(out: &mut String, model: &ModelDef) -> anyhow::Result<()> {
  writeln!(out, "\n## {}\n", model.qualified_name())?;
  if let Some(description) = &model.description {
    writeln!(out, "{description}\n")?;
  }

  writeln!(out, "- source: `{}`", model.source)?;
  writeln!(out, "- materialized: {}", model.materialized.as_str())?;
  if let Some(join) = &model.join {
    writeln!(out, "- joins: `{}` on `{}` = `{}`", join.source, join.left, join.right)?;
  }
  if let Some(key) = &model.unique_key {
    writeln!(out, "- unique key: `{key}`")?;
  }
  if let Some(wm) = &model.watermark {
    writeln!(out, "- watermark: `{}` -> `{}`", wm.column, wm.target)?;
  }
  if let Some(cutoff) = &model.cutoff {
    writeln!(out, "- cutoff: {}", cutoff.date)?;
  }
  if !model.tags.is_empty() {
    writeln!(out, "- tags: {}", model.tags.join(", "))?;
  }

  writeln!(out, "\n| column | type | source | description |")?;
  writeln!(out, "|---|---|---|---|")?;
  for (name, t) in model.output_columns() {
    let def = model.columns.iter().find(|c| c.name == name);
    let source = def.map_or("(audit)", |c| c.source_column());
    let description = def.and_then(|c| c.description.as_deref()).unwrap_or("");
    writeln!(out, "| `{name}` | {} | `{source}` | {description} |", type_name(t))?;
  }

  let checks = model.checks()?;
  if !checks.is_empty() {
    writeln!(out, "\n**Checks**\n")?;
    for check in checks {
      write!(out, "- `{}` ({})", check.name, check.severity)?;
      if let Some(note) = &check.note {
        write!(out, ": {note}")?;
      }
      writeln!(out)?;
    }
  }
  Ok(())
}
