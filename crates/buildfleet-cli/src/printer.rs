//! Terminal output for builds: progress lines on stderr, print-mode results
//! on stdout.

use std::io::{self, Write};

use buildfleet_core::options::PrintFunc;
use buildfleet_core::{
    BoxError, BuildReporter, BuildWarning, DiscardRenderer, ExporterResponse, NodeSet,
    ProgressEvent, ProgressRenderer,
};
use clap::ValueEnum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProgressMode {
    /// One line per status update
    Plain,
    /// No progress output
    Quiet,
}

/// Writes one line per progress event.
///
/// The first write error is held and returned from `finish`, so a closed
/// stderr fails the build instead of being silently dropped.
pub struct PlainRenderer<W> {
    out: W,
    multi_node: bool,
    failed: Option<io::Error>,
}

impl<W: Write + Send> PlainRenderer<W> {
    pub fn new(out: W, multi_node: bool) -> Self {
        Self {
            out,
            multi_node,
            failed: None,
        }
    }

    fn line(&self, event: &ProgressEvent) -> String {
        match event {
            ProgressEvent::Status {
                node,
                target,
                message,
            } => {
                let mut prefix = String::new();
                if self.multi_node {
                    prefix.push_str(&format!("[{node}] "));
                }
                if target != buildfleet_core::DEFAULT_TARGET {
                    prefix.push_str(&format!("{target}: "));
                }
                format!("{prefix}{message}")
            }
            ProgressEvent::Warning(w) => format!("[{}] WARNING: {}", w.node, w.short),
        }
    }
}

impl<W: Write + Send> ProgressRenderer for PlainRenderer<W> {
    fn on_event(&mut self, event: &ProgressEvent) {
        if self.failed.is_some() {
            return;
        }
        let line = self.line(event);
        if let Err(e) = writeln!(self.out, "{line}") {
            self.failed = Some(e);
        }
    }

    fn finish(&mut self) -> Result<(), BoxError> {
        if let Some(e) = self.failed.take() {
            return Err(Box::new(e));
        }
        self.out.flush()?;
        Ok(())
    }
}

/// Summary block printed once every branch has settled.
pub fn format_warnings(warnings: &[BuildWarning], verbose: bool) -> String {
    if warnings.is_empty() {
        return String::new();
    }
    let noun = if warnings.len() == 1 { "warning" } else { "warnings" };
    let mut out = if verbose {
        format!("{} {noun} found:\n", warnings.len())
    } else {
        format!("{} {noun} found (use --debug to expand):\n", warnings.len())
    };
    for w in warnings {
        out.push_str(&format!(" - {} (node {})\n", w.short, w.node));
        if verbose {
            for line in &w.detail {
                out.push_str(&format!("   {line}\n"));
            }
            if let Some(url) = &w.url {
                out.push_str(&format!("   More info: {url}\n"));
            }
        }
    }
    out
}

/// What a print-mode subrequest shows on stdout.
///
/// Engines answer with `result.txt` and, for `format=json`, `result.json`.
/// Anything else falls back to the raw response as `key=value` lines.
pub fn format_print_result(func: &PrintFunc, response: &ExporterResponse) -> String {
    let key = match func.format.as_deref() {
        Some("json") => "result.json",
        _ => "result.txt",
    };
    if let Some(body) = response.get(key) {
        let mut out = body.clone();
        if !out.ends_with('\n') {
            out.push('\n');
        }
        return out;
    }
    response
        .iter()
        .map(|(k, v)| format!("{k}={v}\n"))
        .collect()
}

/// Build callbacks for the terminal.
#[derive(Debug, Clone)]
pub struct TerminalReporter {
    mode: ProgressMode,
    verbose: bool,
}

impl TerminalReporter {
    pub fn new(mode: ProgressMode, verbose: bool) -> Self {
        Self { mode, verbose }
    }
}

impl BuildReporter for TerminalReporter {
    fn progress(&self, nodes: &NodeSet) -> Box<dyn ProgressRenderer> {
        match self.mode {
            ProgressMode::Plain => Box::new(PlainRenderer::new(io::stderr(), nodes.len() > 1)),
            ProgressMode::Quiet => Box::new(DiscardRenderer),
        }
    }

    fn warnings(&self, warnings: &[BuildWarning]) {
        let text = format_warnings(warnings, self.verbose);
        if !text.is_empty() {
            eprint!("{text}");
        }
    }

    fn print_result(
        &self,
        _target: &str,
        func: &PrintFunc,
        response: &ExporterResponse,
    ) -> Result<(), BoxError> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(format_print_result(func, response).as_bytes())?;
        stdout.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(node: &str, target: &str, message: &str) -> ProgressEvent {
        ProgressEvent::Status {
            node: node.to_string(),
            target: target.to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn test_plain_renderer_prefixes() {
        let mut buf = Vec::new();
        {
            let mut r = PlainRenderer::new(&mut buf, true);
            r.on_event(&status("arm", "default", "[1/3] FROM alpine"));
            r.on_event(&status("amd", "lint", "done"));
            r.finish().unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text, "[arm] [1/3] FROM alpine\n[amd] lint: done\n");
    }

    #[test]
    fn test_single_node_has_no_node_prefix() {
        let mut buf = Vec::new();
        {
            let mut r = PlainRenderer::new(&mut buf, false);
            r.on_event(&status("n0", "default", "exporting"));
            r.finish().unwrap();
        }
        assert_eq!(String::from_utf8(buf).unwrap(), "exporting\n");
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_error_reported_on_finish() {
        let mut r = PlainRenderer::new(Broken, false);
        r.on_event(&status("n0", "default", "a"));
        r.on_event(&status("n0", "default", "b"));
        let err = r.finish().unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn test_format_warnings() {
        assert_eq!(format_warnings(&[], false), "");

        let mut w = BuildWarning::new("JSONArgsRecommended");
        w.node = "n1".to_string();
        w.detail = vec!["use JSON arguments for CMD".to_string()];
        w.url = Some("https://docs.example.test/rule".to_string());

        let short = format_warnings(std::slice::from_ref(&w), false);
        assert!(short.starts_with("1 warning found (use --debug to expand)"));
        assert!(short.contains(" - JSONArgsRecommended (node n1)"));
        assert!(!short.contains("More info"));

        let long = format_warnings(&[w.clone(), w], true);
        assert!(long.starts_with("2 warnings found:"));
        assert!(long.contains("use JSON arguments"));
        assert!(long.contains("More info: https://docs.example.test/rule"));
    }

    #[test]
    fn test_format_print_result() {
        let mut resp = ExporterResponse::new();
        resp.insert("result.txt".to_string(), "TARGET  DESCRIPTION".to_string());
        resp.insert("result.json".to_string(), "{\"targets\":[]}".to_string());

        let text = PrintFunc {
            name: "targets".to_string(),
            format: None,
        };
        assert_eq!(format_print_result(&text, &resp), "TARGET  DESCRIPTION\n");

        let json = PrintFunc {
            name: "targets".to_string(),
            format: Some("json".to_string()),
        };
        assert_eq!(format_print_result(&json, &resp), "{\"targets\":[]}\n");

        let mut other = ExporterResponse::new();
        other.insert("a".to_string(), "1".to_string());
        assert_eq!(format_print_result(&text, &other), "a=1\n");
    }
}
