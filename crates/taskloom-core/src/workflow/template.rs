//! Built-in workflow templates.
//!
//! Each template renders a commented YAML definition that parses and
//! validates as-is. URLs point at placeholder hosts and are meant to be
//! edited before submission.

use taskloom_types::workflow::WorkflowDefinition;

use super::definition::{DefinitionError, parse_definition, validate_definition};

/// A named starter definition.
#[derive(Debug, Clone, Copy)]
pub struct WorkflowTemplate {
    pub id: &'static str,
    pub description: &'static str,
    render: fn(&str) -> String,
}

impl WorkflowTemplate {
    /// YAML source with `name` as the workflow name.
    pub fn yaml(&self, name: &str) -> String {
        (self.render)(name)
    }

    /// Render, parse, and validate in one step.
    pub fn definition(&self, name: &str) -> Result<WorkflowDefinition, DefinitionError> {
        let def = parse_definition(&self.yaml(name))?;
        validate_definition(&def)?;
        Ok(def)
    }
}

/// Every built-in template, in display order.
pub const TEMPLATES: &[WorkflowTemplate] = &[
    WorkflowTemplate {
        id: "price-comparison",
        description: "Fetch two sources in parallel and compare once both arrive",
        render: price_comparison,
    },
    WorkflowTemplate {
        id: "form-filling",
        description: "Load a form, prepare fields in parallel, then submit",
        render: form_filling,
    },
    WorkflowTemplate {
        id: "price-monitoring",
        description: "Poll a price with retries and alert through a fallback",
        render: price_monitoring,
    },
    WorkflowTemplate {
        id: "pagination-scraping",
        description: "Fetch pages one at a time through a shared group and merge them",
        render: pagination_scraping,
    },
    WorkflowTemplate {
        id: "multi-source-comparison",
        description: "Query several sources and report even when some fail",
        render: multi_source_comparison,
    },
];

/// Look up a template by id.
pub fn find_template(id: &str) -> Option<&'static WorkflowTemplate> {
    TEMPLATES.iter().find(|t| t.id == id)
}

fn price_comparison(name: &str) -> String {
    format!(
        r#"# Both fetches start together; compare waits for the two of them.
name: {name}
description: Compare a product price across two stores
tasks:
  fetch-store-a:
    action: http
    parameters:
      url: https://store-a.example.com/api/product/1
    timeout_secs: 30
  fetch-store-b:
    action: http
    parameters:
      url: https://store-b.example.com/api/product/1
    timeout_secs: 30
  compare:
    action: echo
    parameters:
      text: prices collected
    depends_on: [fetch-store-a, fetch-store-b]
config:
  max_retries: 2
  max_concurrency: 2
"#
    )
}

fn form_filling(name: &str) -> String {
    format!(
        r#"# Field preparation fans out after the form loads and joins at submit.
name: {name}
description: Fill and submit a web form
tasks:
  load-form:
    action: http
    parameters:
      url: https://forms.example.com/contact
  fill-name:
    action: echo
    parameters:
      text: Jane Doe
    depends_on: [load-form]
  fill-email:
    action: echo
    parameters:
      text: jane@example.com
    depends_on: [load-form]
  submit:
    action: http
    parameters:
      url: https://forms.example.com/contact
      method: POST
      json:
        name: Jane Doe
        email: jane@example.com
    depends_on: [fill-name, fill-email]
    retry_policy:
      max_retries: 1
config:
  fail_fast: true
"#
    )
}

fn price_monitoring(name: &str) -> String {
    format!(
        r#"# A failed check runs `alert-failure` in its place.
name: {name}
description: Check a product price and notify on the result
tasks:
  check-price:
    action: http
    parameters:
      url: https://store-a.example.com/api/product/1
    timeout_secs: 20
    retry_policy:
      max_retries: 5
      base_delay_ms: 500
      max_delay_ms: 10000
    fallback: alert-failure
  alert-failure:
    action: echo
    parameters:
      text: price check failed
  notify:
    action: echo
    parameters:
      text: price checked
    depends_on: [check-price]
"#
    )
}

fn pagination_scraping(name: &str) -> String {
    format!(
        r#"# Pages share a parallel group so only one request is in flight at a time.
name: {name}
description: Scrape a paginated listing
tasks:
  page-1:
    action: http
    parameters:
      url: https://listing.example.com/items?page=1
    parallel_group: listing
  page-2:
    action: http
    parameters:
      url: https://listing.example.com/items?page=2
    parallel_group: listing
  page-3:
    action: http
    parameters:
      url: https://listing.example.com/items?page=3
    parallel_group: listing
  merge:
    action: echo
    parameters:
      text: pages merged
    depends_on: [page-1, page-2, page-3]
config:
  max_retries: 3
  base_delay_ms: 1000
"#
    )
}

fn multi_source_comparison(name: &str) -> String {
    format!(
        r#"# `report` runs even when a source fails, since fail_fast is off.
name: {name}
description: Compare the same query across several sources
tasks:
  source-a:
    action: http
    parameters:
      url: https://a.example.com/search?q=widget
  source-b:
    action: http
    parameters:
      url: https://b.example.com/search?q=widget
  source-c:
    action: http
    parameters:
      url: https://c.example.com/search?q=widget
  report:
    action: echo
    parameters:
      text: comparison ready
    depends_on: [source-a, source-b, source-c]
    run_on_failure: true
config:
  fail_fast: false
  max_concurrency: 3
"#
    )
}
