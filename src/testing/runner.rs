//! Scenario runner implementation
//!
//! Loads a YAML scenario, builds its steps and drives them through the
//! scenario executor, printing progress for humans.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use colored::Colorize;

use crate::common::config::Config;
use crate::common::{Category, Result};
use crate::params::Params;
use crate::scenario::{Lifecycle, Scenario};

use super::config::TestScenario;

/// Result of a scenario run
#[derive(Debug)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub steps_total: usize,
    pub error: Option<String>,
    pub category: Option<Category>,
}

/// Run a scenario from a YAML file
///
/// `overrides` replace variables declared in the file. Problems with the
/// file itself are returned as errors; a scenario that runs and fails is
/// reported through [`TestResult`].
pub async fn run_scenario(
    path: &Path,
    verbose: bool,
    overrides: &BTreeMap<String, String>,
    config: &Config,
) -> Result<TestResult> {
    let scenario = TestScenario::load(path)?;
    let base = path.parent().unwrap_or(Path::new("."));
    let steps = scenario.build_steps(base)?;
    let steps_total = steps.len();

    println!(
        "\n{} {}",
        "Running Scenario:".blue().bold(),
        scenario.name.white().bold()
    );
    if let Some(desc) = &scenario.description {
        println!("  {}", desc.dimmed());
    }

    let mut vars = scenario.vars.clone();
    vars.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

    let extra_ports: Vec<&str> = scenario.ports.iter().map(String::as_str).collect();
    let mut params = Params::with_extra_ports(&scenario.name, vars, config.clone(), &extra_ports)?;
    if let Some(secs) = scenario.deadline_secs {
        params = params.with_deadline(Duration::from_secs(secs));
    }

    if verbose {
        println!("\n{}", "Ports:".cyan());
        for (name, port) in params.ports().to_map() {
            println!("  {} = {}", name, port.to_string().dimmed());
        }
        println!("\n{}", "Steps:".cyan());
        for (i, step) in steps.iter().enumerate() {
            println!("  {}. {}", i + 1, step.kind());
        }
    }

    let mut executor = Scenario::from(steps);
    match executor.run(&mut params).await {
        Ok(()) => {
            println!(
                "\n{} {}\n",
                "✓".green().bold(),
                "Scenario Passed".green().bold()
            );
            Ok(TestResult {
                name: scenario.name,
                passed: true,
                steps_total,
                error: None,
                category: None,
            })
        }
        Err(e) => {
            println!("\n{} {}", "✗".red().bold(), "Scenario Failed".red().bold());
            println!("  [{}] {}\n", e.category().to_string().yellow(), e);
            Ok(TestResult {
                name: scenario.name,
                passed: false,
                steps_total,
                error: Some(e.to_string()),
                category: Some(e.category()),
            })
        }
    }
}
