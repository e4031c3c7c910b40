//! HTML rendering of the single view.
//!
//! `render_page` is a pure function of the view state: the live video, the
//! device picker and the ranked results in the order the classifier returned them.
use std::fmt::Write;

use common::protocol::{Device, Phase, Prediction, ViewState};

const STYLE: &str = r#"
    body { font-family: sans-serif; max-width: 1280px; margin: 0 auto; padding-top: 0.5rem; }
    .layout { display: flex; flex-wrap: wrap; gap: 1rem; }
    #video { width: 400px; height: 400px; object-fit: cover; cursor: pointer; background: #eee; }
    #devices { display: block; width: 400px; margin-top: 0.5rem; padding: 0.3rem; background: #f7fafc; }
    .results { list-style: none; padding: 0; }
    .row { padding: 1rem; margin-bottom: 0.5rem; border: 1px solid #e2e8f0; border-radius: 0.5rem; background: #f7fafc; }
    .row.loading { color: #a0aec0; background: #edf2f7; }
    .tag { display: inline-block; padding: 0.1rem 0.5rem; margin-right: 0.3rem; border-radius: 0.3rem; background: #e2e8f0; }
    .tag:hover { background: #bee3f8; }
    .confidence { font-size: 1.5rem; font-weight: bold; }
    .fault { padding: 0.5rem 1rem; border-radius: 0.3rem; background: #fed7d7; color: #742a2a; }
"#;

const SCRIPT: &str = r#"
    async function classify() {
        await fetch("/classify", { method: "POST" });
        location.reload();
    }
    async function selectDevice(id) {
        await fetch("/device?id=" + encodeURIComponent(id), { method: "POST" });
        location.reload();
    }
"#;

/// Render the whole page.
pub fn render_page(state: &ViewState) -> String {
    let mut html = String::with_capacity(4096);

    html.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    if needs_refresh(state.phase) {
        html.push_str("<meta http-equiv=\"refresh\" content=\"1\">\n");
    }
    write!(
        html,
        "<title>Webcam classifier</title>\n<style>{STYLE}</style>\n<script>{SCRIPT}</script>\n</head>\n<body>\n"
    )
    .ok();

    if let Some(fault) = &state.fault {
        writeln!(html, "<div class=\"fault\">{}</div>", escape(&fault.to_string())).ok();
    }

    html.push_str("<div class=\"layout\">\n<div>\n");
    // MJPEG previews only play in an <img>
    html.push_str(
        "<img id=\"video\" src=\"/stream\" alt=\"camera\" title=\"Click to classify\" onclick=\"classify()\">\n",
    );
    html.push_str(&render_devices(&state.devices, state.selected.as_deref()));
    html.push_str("</div>\n<div>\n<h1>Results:</h1>\n");
    html.push_str(&render_results(&state.results));
    html.push_str("</div>\n</div>\n</body>\n</html>\n");

    html
}

/// Keep reloading while the state is expected to change on its own.
fn needs_refresh(phase: Phase) -> bool {
    matches!(
        phase,
        Phase::Idle | Phase::AwaitingPrerequisites | Phase::Classifying
    )
}

/// Device picker with the selected device marked.
pub fn render_devices(devices: &[Device], selected: Option<&str>) -> String {
    let mut html = String::from("<select id=\"devices\" onchange=\"selectDevice(this.value)\">\n");
    for device in devices {
        let marker = match selected == Some(device.id.as_str()) {
            true => " selected",
            false => "",
        };
        writeln!(
            html,
            "<option value=\"{}\"{}>{}</option>",
            escape(&device.id),
            marker,
            escape(&device.label)
        )
        .ok();
    }
    html.push_str("</select>\n");

    html
}

/// Result rows, in the given order.
pub fn render_results(results: &[Prediction]) -> String {
    let mut html = String::from("<ol class=\"results\">\n");
    for prediction in results {
        html.push_str(&render_row(prediction));
    }
    html.push_str("</ol>\n");

    html
}

/// One result row, or its placeholder while label or confidence is missing.
pub fn render_row(prediction: &Prediction) -> String {
    if !prediction.is_loaded() {
        return "<li class=\"row loading\">Loading...</li>\n".to_owned();
    }

    let mut html = String::from("<li class=\"row\">\n<div class=\"tags\">");
    for name in prediction.sub_labels() {
        write!(html, "<span class=\"tag\">{}</span>", escape(name)).ok();
    }
    writeln!(
        html,
        "</div>\n<div class=\"confidence\">{}</div>\n</li>",
        prediction.confidence
    )
    .ok();

    html
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}
