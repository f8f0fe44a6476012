//! Table formatting helpers for CLI output.

use comfy_table::{ContentArrangement, Table};
use opennet_runtime::dry_run::CommandScope;
use opennet_runtime::Endpoint;

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Table of endpoints with their namespace and address.
pub fn endpoint_table(endpoints: &[Endpoint]) -> Table {
    let mut table = new_table(&["ENDPOINT", "HOST", "NAMESPACE", "BRIDGE", "ADDRESS", "STATE"]);
    for endpoint in endpoints {
        table.add_row(vec![
            endpoint.name().to_string(),
            endpoint.host().name().to_string(),
            endpoint.host().namespace_target(),
            format!("tapBridges[{}]", endpoint.bridge_index()),
            endpoint
                .address()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string()),
            endpoint.state().to_string(),
        ]);
    }
    table
}

/// Statement text for a table cell: queries collapse to their condition
/// line, and long lines are cut at `width` characters.
pub fn statement_cell(statement: &str, width: usize) -> String {
    let line = statement.lines().next().unwrap_or("").trim_end();
    if line.chars().count() <= width {
        return line.to_string();
    }
    let cut: String = line.chars().take(width.saturating_sub(3)).collect();
    format!("{cut}...")
}

pub fn scope_label(scope: CommandScope) -> &'static str {
    match scope {
        CommandScope::Host => "host",
        CommandScope::Root => "root",
    }
}
