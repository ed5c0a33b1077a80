use kiln_core::{Diagnostic, Diagnostics, SharedUi};

fn render(diag: &Diagnostic) -> String {
    let label = if diag.is_error() { "Error" } else { "Warning" };
    let mut out = format!("{label}: {}", diag.summary);
    if let Some(subject) = &diag.subject {
        out.push_str(&format!("\n\n  on {subject}"));
    }
    if !diag.detail.is_empty() {
        out.push_str(&format!("\n\n{}", diag.detail));
    }
    out.push('\n');
    out
}

/// Prints diagnostics with their severity; errors go to the error stream.
pub fn write_diagnostics(ui: &SharedUi, diags: &Diagnostics) {
    for diag in diags.iter() {
        if diag.is_error() {
            ui.error(&render(diag));
        } else {
            ui.say(&render(diag));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::RecordingUi;
    use std::sync::Arc;

    #[test]
    fn severity_picks_the_stream() {
        let rec = Arc::new(RecordingUi::new());
        let ui: SharedUi = rec.clone();
        let mut diags = Diagnostics::new();
        diags.push(Diagnostic::error("No builds to run").with_detail("select at least one build"));
        diags.push(Diagnostic::warning("unused variable").with_subject("web.kiln.toml"));
        write_diagnostics(&ui, &diags);

        let errors = rec.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Error: No builds to run"));
        assert!(errors[0].contains("select at least one build"));
        assert!(rec.said().iter().any(|l| l.starts_with("Warning: unused variable") && l.contains("on web.kiln.toml")));
    }
}
