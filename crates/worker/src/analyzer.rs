use analysisflow::config::Config;
use analysisflow::jobs::{Analyzer, CommandAnalyzer};
use std::sync::Arc;

pub fn build_analyzer(cfg: &Config) -> anyhow::Result<Arc<dyn Analyzer>> {
    let line = cfg
        .analyzer_cmd
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("AF_ANALYZER_CMD is missing"))?;
    let analyzer = CommandAnalyzer::from_command_line(line)
        .ok_or_else(|| anyhow::anyhow!("AF_ANALYZER_CMD is empty"))?;

    tracing::info!(program = analyzer.program(), "analyzer configured");
    Ok(Arc::new(analyzer))
}
