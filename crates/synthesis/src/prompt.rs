//! Prompt assembly
//!
//! The prompt has three regions: a system preamble (task, output schema,
//! locale policy, grounding instruction), a `<contexts>` block, and the user
//! question. Chunk texts are truncated to a per-chunk character budget and
//! the aggregate is capped by dropping lowest-ranked chunks first, so the
//! context set handed back to the caller is exactly what the model saw.

use quarry_core::RerankedContext;
use quarry_llm::Message;

/// Character budgets for context assembly
#[derive(Debug, Clone, Copy)]
pub struct PromptBudgets {
    /// Per-chunk text budget
    pub chunk_chars: usize,
    /// Aggregate context budget
    pub total_chars: usize,
}

impl Default for PromptBudgets {
    fn default() -> Self {
        Self {
            chunk_chars: 1200,
            total_chars: 12_000,
        }
    }
}

/// Build the chat messages and return the contexts that actually made it
/// into the prompt (the citation-validation set).
pub fn build_messages(
    query: &str,
    contexts: &[RerankedContext],
    locale: Option<&str>,
    budgets: PromptBudgets,
) -> (Vec<Message>, Vec<RerankedContext>) {
    let kept = apply_budgets(contexts, budgets);

    let mut context_block = String::from("<contexts>\n");
    for ctx in &kept {
        context_block.push_str(&format!(
            "  <context chunk_id=\"{}\" title=\"{}\" url=\"{}\" published_at=\"{}\">\n",
            escape_xml(&ctx.chunk_id),
            escape_xml(ctx.title.as_deref().unwrap_or("")),
            escape_xml(ctx.url.as_deref().unwrap_or("")),
            ctx.published_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_default(),
        ));
        context_block.push_str(&escape_xml(&ctx.text));
        context_block.push_str("\n  </context>\n");
    }
    context_block.push_str("</contexts>");

    let messages = vec![
        Message::system(system_preamble(locale)),
        Message::user(format!(
            "{}\n\n<question>{}</question>",
            context_block,
            escape_xml(query)
        )),
    ];

    (messages, kept)
}

fn system_preamble(locale: Option<&str>) -> String {
    let locale_policy = match locale {
        Some(l) => format!("Answer in the language of locale \"{}\".", l),
        None => "Answer in the language of the question.".to_string(),
    };

    format!(
        "You answer questions about a corpus of articles using only the \
         provided context chunks.\n\
         {}\n\
         Respond with a single JSON object matching this schema exactly:\n\
         {{\"answer\": string, \"citations\": [{{\"chunk_id\": string, \
         \"reason\": string?}}], \"fallback\": boolean, \"reason\": string}}\n\
         Rules:\n\
         - Every claim in the answer must be supported by at least one cited \
         chunk; cite chunks by their chunk_id attribute.\n\
         - Quote only from the provided chunks; never invent chunk ids.\n\
         - If the contexts do not contain enough information to answer, set \
         fallback to true, leave the answer empty, and explain why in \
         reason.",
        locale_policy
    )
}

/// Truncate each chunk to the per-chunk budget and drop lowest-ranked chunks
/// until the aggregate fits
fn apply_budgets(contexts: &[RerankedContext], budgets: PromptBudgets) -> Vec<RerankedContext> {
    let mut kept: Vec<RerankedContext> = contexts
        .iter()
        .map(|ctx| {
            let mut ctx = ctx.clone();
            ctx.text = truncate_chars(&ctx.text, budgets.chunk_chars);
            ctx
        })
        .collect();

    // Contexts arrive best-first; drop from the tail until within budget
    let mut total: usize = kept.iter().map(|c| c.text.chars().count()).sum();
    while total > budgets.total_chars && !kept.is_empty() {
        if let Some(dropped) = kept.pop() {
            total -= dropped.text.chars().count();
            tracing::debug!(chunk_id = %dropped.chunk_id, "Context dropped for budget");
        }
    }

    kept
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(chunk_id: &str, rank: usize, text: &str) -> RerankedContext {
        RerankedContext {
            chunk_id: chunk_id.to_string(),
            article_id: "a1".to_string(),
            score: 1.0 / rank as f32,
            rank,
            text: text.to_string(),
            title: Some("Title <1>".to_string()),
            url: Some("http://example.com?a=1&b=2".to_string()),
            published_at: None,
            document_version: 1,
        }
    }

    #[test]
    fn test_prompt_regions_present() {
        let contexts = vec![context("c1", 1, "chunk text")];
        let (messages, kept) = build_messages("what is a TPU?", &contexts, Some("ja"), PromptBudgets::default());

        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.contains("fallback"));
        assert!(messages[0].content.contains("ja"));
        assert!(messages[1].content.contains("<contexts>"));
        assert!(messages[1].content.contains("chunk_id=\"c1\""));
        assert!(messages[1].content.contains("<question>what is a TPU?</question>"));
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_xml_escaping() {
        let contexts = vec![context("c1", 1, "a < b & c > d")];
        let (messages, _) = build_messages("q", &contexts, None, PromptBudgets::default());
        assert!(messages[1].content.contains("a &lt; b &amp; c &gt; d"));
        assert!(messages[1].content.contains("http://example.com?a=1&amp;b=2"));
    }

    #[test]
    fn test_per_chunk_budget_truncates() {
        let long = "x".repeat(5000);
        let contexts = vec![context("c1", 1, &long)];
        let budgets = PromptBudgets {
            chunk_chars: 100,
            total_chars: 12_000,
        };
        let (_, kept) = build_messages("q", &contexts, None, budgets);
        assert_eq!(kept[0].text.chars().count(), 100);
    }

    #[test]
    fn test_total_budget_drops_lowest_ranked_first() {
        let contexts = vec![
            context("c1", 1, &"a".repeat(400)),
            context("c2", 2, &"b".repeat(400)),
            context("c3", 3, &"c".repeat(400)),
        ];
        let budgets = PromptBudgets {
            chunk_chars: 1200,
            total_chars: 900,
        };
        let (_, kept) = build_messages("q", &contexts, None, budgets);
        let ids: Vec<&str> = kept.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
    }

    #[test]
    fn test_multibyte_truncation_is_safe() {
        let japanese = "日本語のテキスト".repeat(50);
        let truncated = truncate_chars(&japanese, 10);
        assert_eq!(truncated.chars().count(), 10);
    }
}
