use crate::feed::Entry;
use crate::matrix::Message;

const UNTITLED: &str = "No Title";

/// Turns an entry into a postable message: bold title, link, then the summary.
pub fn render_entry(entry: &Entry, msgtype: &str, include_summary: bool) -> Message {
    let title = match entry.title.trim() {
        "" => UNTITLED,
        title => title,
    };
    let summary = entry
        .summary
        .as_deref()
        .map(str::trim)
        .filter(|s| include_summary && !s.is_empty());

    let mut body = title.to_string();
    let mut html = format!("<strong>{}</strong>", escape_html(title));
    if !entry.link.is_empty() {
        body.push('\n');
        body.push_str(&entry.link);
        let link = escape_html(&entry.link);
        html.push_str(&format!("<br><a href=\"{link}\">{link}</a>"));
    }
    if let Some(summary) = summary {
        body.push_str("\n\n");
        body.push_str(summary);
        // Feed summaries are already HTML.
        html.push_str("<br><br>");
        html.push_str(summary);
    }

    Message {
        msgtype: msgtype.to_string(),
        body,
        formatted_body: Some(html),
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
