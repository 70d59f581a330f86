//! Structured filter-graph descriptions.
//!
//! A [`FilterGraph`] is a list of [`FilterChain`]s, each reading labelled
//! streams, applying a sequence of [`Filter`]s, and producing labelled
//! streams. The graph is built as plain data and only turned into ffmpeg's
//! `-filter_complex` syntax by its `Display` impl, so it can be inspected and
//! tested without running the engine.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// A single filter operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Duplicate the input into `outputs` identical streams.
    Split { outputs: usize },
    /// Keep only `[start, end)` seconds of the input.
    Trim { start: f64, end: f64 },
    /// Rebase timestamps so the stream starts at zero.
    ResetPts,
    /// Blend two streams with a linear time-weighted cross-fade over
    /// `duration` seconds: `A*(1-T/d) + B*(T/d)`.
    Crossfade { duration: f64 },
    /// Play `segments` video-only streams back to back.
    Concat { segments: usize },
}

/// A chain of filters between labelled input and output pads.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterChain {
    pub inputs: Vec<String>,
    pub filters: Vec<Filter>,
    pub outputs: Vec<String>,
}

/// An ordered set of filter chains.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterGraph {
    pub chains: Vec<FilterChain>,
}

#[derive(Error, Debug, PartialEq)]
pub enum GraphError {
    #[error("Stream [{0}] is consumed but never produced")]
    Unproduced(String),
    #[error("Stream [{0}] is produced more than once")]
    Reproduced(String),
    #[error("Stream [{0}] is consumed {1} times")]
    Reused(String, usize),
    #[error("Stream [{0}] is produced but never consumed")]
    Dangling(String),
}

impl FilterChain {
    pub fn new(inputs: &[&str], filters: Vec<Filter>, outputs: &[&str]) -> Self {
        Self {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            filters,
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl FilterGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chain(mut self, chain: FilterChain) -> Self {
        self.chains.push(chain);
        self
    }

    /// Check the graph's wiring: every intermediate label is produced exactly
    /// once and consumed exactly once. Source pads (`0:v` style) may only be
    /// consumed; `sinks` name the labels that leave the graph.
    pub fn validate(&self, sinks: &[&str]) -> Result<(), GraphError> {
        let mut produced: HashMap<&str, usize> = HashMap::new();
        let mut consumed: HashMap<&str, usize> = HashMap::new();

        for chain in &self.chains {
            for label in &chain.outputs {
                *produced.entry(label.as_str()).or_insert(0) += 1;
            }
            for label in &chain.inputs {
                *consumed.entry(label.as_str()).or_insert(0) += 1;
            }
        }

        for (label, count) in &produced {
            if *count > 1 {
                return Err(GraphError::Reproduced(label.to_string()));
            }
        }

        for (label, count) in &consumed {
            if is_source_pad(label) {
                continue;
            }
            if !produced.contains_key(label) {
                return Err(GraphError::Unproduced(label.to_string()));
            }
            if *count > 1 {
                return Err(GraphError::Reused(label.to_string(), *count));
            }
        }

        for label in produced.keys() {
            if !consumed.contains_key(label) && !sinks.contains(label) {
                return Err(GraphError::Dangling(label.to_string()));
            }
        }

        Ok(())
    }
}

/// Input stream specifiers like `0:v` refer to demuxed sources, not graph pads.
fn is_source_pad(label: &str) -> bool {
    label
        .split_once(':')
        .is_some_and(|(index, _)| !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()))
}

/// Format seconds for the engine: millisecond precision, trailing zeros dropped.
pub fn format_secs(secs: f64) -> String {
    let s = format!("{:.3}", secs);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s.is_empty() || s == "-" || s == "-0" {
        "0".to_string()
    } else {
        s.to_string()
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Split { outputs } => write!(f, "split={}", outputs),
            Filter::Trim { start, end } => {
                write!(f, "trim=start={}:end={}", format_secs(*start), format_secs(*end))
            }
            Filter::ResetPts => write!(f, "setpts=PTS-STARTPTS"),
            Filter::Crossfade { duration } => {
                let d = format_secs(*duration);
                write!(f, "blend=all_expr='A*(1-T/{d})+B*(T/{d})'")
            }
            Filter::Concat { segments } => write!(f, "concat=n={}:v=1:a=0", segments),
        }
    }
}

impl fmt::Display for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for label in &self.inputs {
            write!(f, "[{}]", label)?;
        }
        for (i, filter) in self.filters.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", filter)?;
        }
        for label in &self.outputs {
            write!(f, "[{}]", label)?;
        }
        Ok(())
    }
}

impl fmt::Display for FilterGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chain) in self.chains.iter().enumerate() {
            if i > 0 {
                write!(f, ";")?;
            }
            write!(f, "{}", chain)?;
        }
        Ok(())
    }
}
