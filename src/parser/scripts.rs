use std::sync::LazyLock;

use scraper::{Html, Selector};

static SCRIPT_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("script").unwrap());

/// One `<script>` element: its `src` attribute (if any) and inline text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptBlock {
    pub src: Option<String>,
    pub text: String,
}

/// Every script element of the page, in document order.
pub fn extract_scripts(html: &str) -> Vec<ScriptBlock> {
    let document = Html::parse_document(html);
    document
        .select(&SCRIPT_SEL)
        .map(|el| ScriptBlock {
            src: el.value().attr("src").map(str::to_string),
            text: el.text().collect::<Vec<_>>().join("\n"),
        })
        .collect()
}
