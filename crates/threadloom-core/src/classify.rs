//! Heuristic, explainable message classification.
//!
//! Four independent detectors each add fixed weights for the signals they
//! find and return `None` below their floor. A message can carry several
//! labels at once. Every classification lists the signals that produced it.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::graph::ReplyGraph;
use crate::models::{CanonicalMessage, Classification, ClassificationType, Enrichment};

const QUESTION_FLOOR: f64 = 0.2;
const SOLUTION_FLOOR: f64 = 0.25;
const ACK_FLOOR: f64 = 0.2;
const ANSWER_BASE: f64 = 0.3;

const QUESTION_STARTERS: &[&str] = &[
    "how do i",
    "how do you",
    "how can i",
    "how to",
    "how does",
    "what is",
    "what's",
    "what are",
    "what does",
    "why is",
    "why does",
    "why do",
    "why am i",
    "where is",
    "where do",
    "where can",
    "when is",
    "when do",
    "which",
    "who knows",
    "is there",
    "are there",
    "is it possible",
    "can i",
    "can you",
    "can someone",
    "could you",
    "could someone",
    "does anyone",
    "anyone know",
    "has anyone",
    "do you know",
    "should i",
    "would it",
];

const HELP_PHRASES: &[&str] = &[
    "need help",
    "help me",
    "i'm stuck",
    "im stuck",
    "stuck on",
    "having trouble",
    "having issues",
    "problem with",
    "issue with",
    "not working",
    "doesn't work",
    "does not work",
    "can't figure",
    "can't get",
    "unable to",
    "trying to figure",
    "any idea",
    "any ideas",
    "any suggestions",
];

const ANSWER_PHRASES: &[&str] = &[
    "you can",
    "you could",
    "you should",
    "you need to",
    "you might",
    "try ",
    "have you tried",
    "the issue is",
    "the problem is",
    "the reason is",
    "this is because",
    "it's because",
    "that's because",
    "i think",
    "i believe",
    "make sure",
    "instead of",
    "should work",
    "the answer is",
];

const SOLUTION_PHRASES: &[&str] = &[
    "try this",
    "here's how",
    "here is how",
    "you can fix",
    "to fix this",
    "to fix it",
    "the fix is",
    "the solution is",
    "solved by",
    "fixed by",
    "workaround",
    "this should work",
    "this works",
    "run this",
    "use this",
    "the trick is",
    "what worked for me",
];

const POSITIVE_SYMBOLS: &[&str] = &[
    "👍", "🙏", "🎉", "✅", "👌", "🙌", "💯", "❤️", "😊", "🚀", ":+1:", ":thumbsup:", ":pray:",
    ":tada:", ":white_check_mark:", ":raised_hands:", ":100:", ":heart:",
];

const AFFIRMATIVES: &[&str] = &[
    "ok",
    "okay",
    "k",
    "got it",
    "yes",
    "yep",
    "yup",
    "great",
    "awesome",
    "perfect",
    "nice",
    "cool",
    "sounds good",
    "will do",
    "done",
    "lgtm",
    "+1",
];

static THANKS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(thank you|thanks|thank u|thx|thnx|tysm|ty|much appreciated|appreciate it|cheers)\b")
        .unwrap()
});
static SUCCESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(that worked|it worked|worked (?:for me|perfectly|great|like a charm)|works now|working now|it works|that fixed|fixed it|solved it|solved|did the trick|problem solved|all good now)\b")
        .unwrap()
});

/// Words that flip a success phrase right after them ("never worked").
const NEGATIONS: &[&str] = &["not", "never", "no", "nothing", "nobody", "neither", "nor", "barely", "hardly"];
static NUMBERED_LIST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*\d+[.)]\s+\S").unwrap());
static BULLET_LIST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*[-*•]\s+\S").unwrap());
static SEQUENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\bfirst\b.*\bthen\b.*\bfinally\b").unwrap());
static STEP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bstep\s*\d+").unwrap());
static QUOTE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[ \t]*>").unwrap());
static DOC_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(://docs?\.|/docs?/|documentation|readthedocs|/wiki/|/guide|/manual|/reference|/api/|developer\.|stackoverflow\.com|/blob/)")
        .unwrap()
});

/// What the answer detector knows about the thread a message sits in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadContext {
    /// Another message in the same thread was classified as a question.
    pub has_question: bool,
    /// Author of the earliest such question.
    pub question_author: Option<String>,
    pub is_thread_root: bool,
}

/// Accumulates weighted signals for one detector.
struct Score {
    confidence: f64,
    signals: Vec<String>,
}

impl Score {
    fn new() -> Self {
        Self {
            confidence: 0.0,
            signals: Vec::new(),
        }
    }

    fn add(&mut self, weight: f64, signal: impl Into<String>) {
        self.confidence += weight;
        self.signals.push(signal.into());
    }

    fn finish(
        self,
        message: &CanonicalMessage,
        kind: ClassificationType,
        floor: f64,
    ) -> Option<Classification> {
        if self.signals.is_empty() || self.confidence < floor {
            return None;
        }
        Some(Classification {
            message_id: message.id.clone(),
            kind,
            confidence: self.confidence.min(1.0),
            signals: self.signals,
        })
    }
}

fn lowered(content: &str) -> String {
    content.trim().to_lowercase().replace('\u{2019}', "'")
}

fn first_contained<'a>(haystack: &str, phrases: &[&'a str]) -> Option<&'a str> {
    phrases.iter().copied().find(|p| haystack.contains(p))
}

pub fn detect_question(message: &CanonicalMessage) -> Option<Classification> {
    let text = lowered(&message.content);
    let mut score = Score::new();

    if text.contains('?') {
        score.add(0.4, "question_mark");
    }
    if let Some(starter) = QUESTION_STARTERS.iter().find(|s| starts_with_phrase(&text, s)) {
        score.add(0.5, format!("question_starter:{}", starter));
    }
    if let Some(phrase) = first_contained(&text, HELP_PHRASES) {
        score.add(0.2, format!("help_seeking:{}", phrase));
    }

    score.finish(message, ClassificationType::Question, QUESTION_FLOOR)
}

/// Prefix match that will not let "which" match "whichever".
fn starts_with_phrase(text: &str, phrase: &str) -> bool {
    match text.strip_prefix(phrase) {
        Some(rest) => rest.chars().next().map_or(true, |c| !c.is_alphanumeric()),
        None => false,
    }
}

pub fn detect_answer(
    message: &CanonicalMessage,
    ctx: Option<&ThreadContext>,
) -> Option<Classification> {
    let ctx = ctx?;
    if !ctx.has_question || ctx.is_thread_root {
        return None;
    }
    let text = lowered(&message.content);
    let mut score = Score::new();
    score.confidence = ANSWER_BASE;

    if let Some(phrase) = first_contained(&text, ANSWER_PHRASES) {
        score.add(0.2, format!("answer_phrase:{}", phrase.trim()));
    }
    if !message.code_blocks.is_empty() {
        score.add(0.2, "contains_code");
    }
    if !message.urls.is_empty() {
        score.add(0.1, "contains_url");
    }
    if message.content.chars().count() > 100 {
        score.add(0.1, "detailed_response");
    }
    if score.signals.is_empty() {
        return None;
    }
    score.signals.insert(0, "in_question_thread".to_string());

    score.finish(message, ClassificationType::Answer, ANSWER_BASE)
}

pub fn detect_solution(message: &CanonicalMessage) -> Option<Classification> {
    let text = lowered(&message.content);
    let mut score = Score::new();

    if !message.code_blocks.is_empty() {
        score.add(0.4, "contains_code");
    }
    if let Some(phrase) = first_contained(&text, SOLUTION_PHRASES) {
        score.add(0.3, format!("solution_phrase:{}", phrase));
    }
    let steps = NUMBERED_LIST_RE.is_match(&message.content)
        || BULLET_LIST_RE.is_match(&message.content)
        || SEQUENCE_RE.is_match(&text)
        || STEP_RE.is_match(&text);
    if steps {
        score.add(0.2, "step_by_step");
    }
    if message.urls.iter().any(|u| DOC_URL_RE.is_match(u)) {
        score.add(0.25, "documentation_link");
    }

    score.finish(message, ClassificationType::Solution, SOLUTION_FLOOR)
}

pub fn detect_acknowledgment(message: &CanonicalMessage) -> Option<Classification> {
    let text = lowered(&message.content);
    let mut score = Score::new();

    if let Some(m) = THANKS_RE.find(&text) {
        score.add(0.3, format!("thanks:{}", m.as_str()));
    }
    if let Some(m) = SUCCESS_RE
        .find_iter(&text)
        .find(|m| !negated_before(&text, m.start()))
    {
        score.add(0.4, format!("success:{}", m.as_str()));
    }
    if let Some(symbol) = first_contained(&message.content, POSITIVE_SYMBOLS) {
        score.add(0.2, format!("positive_symbol:{}", symbol));
    }
    let bare = text.trim_end_matches('!').trim_end();
    if AFFIRMATIVES.contains(&bare) {
        score.add(0.25, format!("affirmative:{}", bare));
    }

    score.finish(message, ClassificationType::Acknowledgment, ACK_FLOOR)
}

/// Whether one of the two words before `at` negates what follows.
fn negated_before(text: &str, at: usize) -> bool {
    text[..at]
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|w| !w.is_empty())
        .rev()
        .take(2)
        .any(|w| NEGATIONS.contains(&w) || w.ends_with("n't"))
}

/// Run every detector; question, answer, solution and acknowledgment order.
pub fn classify_message(
    message: &CanonicalMessage,
    ctx: Option<&ThreadContext>,
) -> Vec<Classification> {
    [
        detect_question(message),
        detect_answer(message, ctx),
        detect_solution(message),
        detect_acknowledgment(message),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Content facts for one message. `is_question` agrees with
/// [`detect_question`].
pub fn enrich_message(message: &CanonicalMessage) -> Enrichment {
    Enrichment {
        message_id: message.id.clone(),
        is_question: detect_question(message).is_some(),
        char_count: message.content.chars().count(),
        word_count: message.content.split_whitespace().count(),
        has_code: !message.code_blocks.is_empty(),
        has_links: !message.urls.is_empty(),
        has_quotes: QUOTE_RE.is_match(&message.content),
    }
}

/// Thread contexts for every message in `graph`, built in one pass.
///
/// Messages are bucketed by thread id; each bucket is scanned once for
/// questions (earliest first) and every member then gets a context that
/// ignores its own question status.
pub fn build_thread_contexts(
    graph: &ReplyGraph,
    messages: &HashMap<&str, &CanonicalMessage>,
) -> HashMap<String, ThreadContext> {
    let mut buckets: HashMap<&str, Vec<&CanonicalMessage>> = HashMap::new();
    for node in graph.nodes().values() {
        if let Some(m) = messages.get(node.message_id.as_str()) {
            buckets.entry(node.thread_id.as_str()).or_default().push(m);
        }
    }

    let mut contexts = HashMap::with_capacity(graph.len());
    for bucket in buckets.values_mut() {
        bucket.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        let questions: Vec<&CanonicalMessage> = bucket
            .iter()
            .copied()
            .filter(|m| detect_question(m).is_some())
            .collect();
        for m in bucket.iter() {
            let asked = questions.iter().find(|q| q.id != m.id);
            contexts.insert(
                m.id.clone(),
                ThreadContext {
                    has_question: asked.is_some(),
                    question_author: asked.map(|q| q.author_id.clone()),
                    is_thread_root: m.is_thread_root,
                },
            );
        }
    }
    contexts
}

/// Classify every message, using thread context derived from the graph.
pub fn classify_all(messages: &[CanonicalMessage]) -> Vec<Classification> {
    let graph = ReplyGraph::build(messages);
    let by_id: HashMap<&str, &CanonicalMessage> =
        messages.iter().map(|m| (m.id.as_str(), m)).collect();
    let contexts = build_thread_contexts(&graph, &by_id);
    messages
        .iter()
        .flat_map(|m| classify_message(m, contexts.get(&m.id)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract;
    use crate::models::SourceType;
    use chrono::{TimeZone, Utc};

    fn msg(content: &str) -> CanonicalMessage {
        let mut m = CanonicalMessage {
            id: "m".into(),
            source_type: SourceType::Slack,
            source_id: "m".into(),
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            author_id: "u1".into(),
            content: content.into(),
            channel_id: "c".into(),
            thread_id: "m".into(),
            parent_id: None,
            is_thread_root: true,
            mentions: Default::default(),
            urls: vec![],
            code_blocks: vec![],
            source_metadata: Default::default(),
        };
        m.urls = extract::extract_urls(content);
        m.code_blocks = extract::extract_code_blocks(content);
        m
    }

    fn reply(id: &str, root: &str, author: &str, secs: i64, content: &str) -> CanonicalMessage {
        let mut m = msg(content);
        m.id = id.into();
        m.thread_id = root.into();
        m.parent_id = Some(root.into());
        m.is_thread_root = false;
        m.author_id = author.into();
        m.timestamp = Utc.timestamp_opt(secs, 0).unwrap();
        m
    }

    fn question_ctx() -> ThreadContext {
        ThreadContext {
            has_question: true,
            question_author: Some("asker".into()),
            is_thread_root: false,
        }
    }

    #[test]
    fn test_question_mark_and_starter() {
        let c = detect_question(&msg("How do I configure this?")).unwrap();
        assert!(c.confidence >= 0.8);
        assert_eq!(c.signals[0], "question_mark");
        assert!(c.signals[1].starts_with("question_starter:"));
    }

    #[test]
    fn test_question_without_mark() {
        let c = detect_question(&msg("anyone know how to fix this")).unwrap();
        assert!(c.confidence >= 0.3);
    }

    #[test]
    fn test_help_seeking_alone_meets_floor() {
        let c = detect_question(&msg("I'm stuck trying to get this working")).unwrap();
        assert!(c.confidence >= 0.2);
        assert!(c.signals.iter().any(|s| s.starts_with("help_seeking")));
    }

    #[test]
    fn test_statements_are_not_questions() {
        assert!(detect_question(&msg("Here's the solution for that.")).is_none());
        assert!(detect_question(&msg("The server is running fine now.")).is_none());
    }

    #[test]
    fn test_question_confidence_capped() {
        let c = detect_question(&msg("How do I fix this? I'm stuck, need help")).unwrap();
        assert!(c.confidence <= 1.0);
    }

    #[test]
    fn test_solution_with_code() {
        let c = detect_solution(&msg("Try this fix:\n```\nnpm install\n```")).unwrap();
        assert!(c.confidence >= 0.6);
        assert!(c.signals.contains(&"contains_code".to_string()));
    }

    #[test]
    fn test_solution_with_steps() {
        let c = detect_solution(&msg(
            "Here's how to fix it:\n1. First do this\n2. Then do that\n3. Finally restart",
        ))
        .unwrap();
        assert!(c.confidence >= 0.4);
        assert!(c.signals.contains(&"step_by_step".to_string()));
    }

    #[test]
    fn test_solution_with_doc_link() {
        let c = detect_solution(&msg("Check out the docs here https://docs.example.com/guide")).unwrap();
        assert!(c.confidence >= 0.25);
        assert!(c.signals.contains(&"documentation_link".to_string()));
    }

    #[test]
    fn test_not_a_solution() {
        assert!(detect_solution(&msg("I have the same problem too")).is_none());
    }

    #[test]
    fn test_ack_thanks_and_success() {
        let c = detect_acknowledgment(&msg("Thanks! That worked perfectly.")).unwrap();
        assert!(c.confidence >= 0.6);
        assert!(c.signals.iter().any(|s| s.starts_with("thanks:")));
        assert!(c.signals.iter().any(|s| s.starts_with("success:")));
    }

    #[test]
    fn test_ack_emoji_only() {
        let c = detect_acknowledgment(&msg("👍")).unwrap();
        assert!(c.confidence >= 0.2);
    }

    #[test]
    fn test_ack_fixed_it() {
        let c = detect_acknowledgment(&msg("That fixed it, thanks!")).unwrap();
        assert!(c.confidence >= 0.6);
    }

    #[test]
    fn test_ack_affirmative() {
        let c = detect_acknowledgment(&msg("Got it!")).unwrap();
        assert!(c.signals.iter().any(|s| s.starts_with("affirmative:")));
    }

    #[test]
    fn test_ack_not_triggered_by_complaints() {
        assert!(detect_acknowledgment(&msg("I still have the same issue")).is_none());
    }

    #[test]
    fn test_ack_thanks_is_boundary_safe() {
        assert!(detect_acknowledgment(&msg("The city streets were gritty after the storm.")).is_none());
        assert!(detect_acknowledgment(&msg("ty so much!")).is_some());
    }

    #[test]
    fn test_ack_ignores_lookalike_words() {
        for text in [
            "That's a pretty interesting approach.",
            "I'm working on the database migration this week.",
            "I worked on the parser yesterday.",
        ] {
            assert!(detect_acknowledgment(&msg(text)).is_none(), "{}", text);
        }
    }

    #[test]
    fn test_ack_success_is_negation_aware() {
        for text in [
            "It never worked for me",
            "It still hasn't worked perfectly",
            "Nothing worked for me so far",
            "The upgrade didn't solve it, not solved",
        ] {
            assert!(detect_acknowledgment(&msg(text)).is_none(), "{}", text);
        }
        let c = detect_acknowledgment(&msg("Oh nice, that worked!")).unwrap();
        assert!(c.signals.contains(&"success:that worked".to_string()));
    }

    #[test]
    fn test_enrich_message() {
        let mut m = msg("> it fails on boot\nDid you try `cargo clean && cargo build`? See https://docs.rs");
        m.id = "e1".into();
        let e = enrich_message(&m);
        assert_eq!(e.message_id, "e1");
        assert!(e.is_question);
        assert!(e.has_code);
        assert!(e.has_links);
        assert!(e.has_quotes);
        assert_eq!(e.word_count, 15);
        assert_eq!(e.char_count, m.content.chars().count());

        let plain = enrich_message(&msg("héllo  wörld"));
        assert_eq!((plain.char_count, plain.word_count), (12, 2));
        assert!(!plain.is_question && !plain.has_code && !plain.has_links && !plain.has_quotes);
        // A `>` inside a line is not a quote.
        assert!(!enrich_message(&msg("a > b")).has_quotes);
    }

    #[test]
    fn test_answer_needs_question_context() {
        let m = reply("r", "q", "helper", 2, "You can fix this by updating your config file");
        let c = detect_answer(&m, Some(&question_ctx())).unwrap();
        assert!(c.confidence >= 0.4);
        assert_eq!(c.signals[0], "in_question_thread");

        assert!(detect_answer(&m, None).is_none());
        let no_question = ThreadContext::default();
        assert!(detect_answer(&m, Some(&no_question)).is_none());
        let root = ThreadContext {
            is_thread_root: true,
            ..question_ctx()
        };
        assert!(detect_answer(&m, Some(&root)).is_none());
    }

    #[test]
    fn test_answer_needs_a_signal_beyond_base() {
        let m = reply("r", "q", "helper", 2, "hmm");
        assert!(detect_answer(&m, Some(&question_ctx())).is_none());
    }

    #[test]
    fn test_multiple_labels() {
        let m = reply("r", "q", "helper", 2, "Try this solution:\n```\nrm -rf node_modules\n```");
        let labels: Vec<_> = classify_message(&m, Some(&question_ctx()))
            .into_iter()
            .map(|c| c.kind)
            .collect();
        assert!(labels.contains(&ClassificationType::Answer));
        assert!(labels.contains(&ClassificationType::Solution));
    }

    #[test]
    fn test_thread_contexts_from_graph() {
        let mut root = msg("How do I configure the proxy?");
        root.id = "q".into();
        root.thread_id = "q".into();
        root.author_id = "asker".into();
        let messages = vec![
            root,
            reply("a", "q", "helper", 1_700_000_100, "You can set HTTP_PROXY in the env"),
            reply("t", "q", "asker", 1_700_000_200, "Thanks! That worked."),
        ];
        let graph = ReplyGraph::build(&messages);
        let by_id: HashMap<&str, &CanonicalMessage> =
            messages.iter().map(|m| (m.id.as_str(), m)).collect();
        let contexts = build_thread_contexts(&graph, &by_id);

        let a = &contexts["a"];
        assert!(a.has_question);
        assert_eq!(a.question_author.as_deref(), Some("asker"));
        assert!(!a.is_thread_root);
        // The root is the only question, so its own context has none.
        assert!(!contexts["q"].has_question);
    }

    #[test]
    fn test_classify_all_end_to_end() {
        let mut root = msg("Why does the build fail on arm64?");
        root.id = "q".into();
        root.thread_id = "q".into();
        let messages = vec![
            root,
            reply("a", "q", "helper", 1_700_000_100, "You need to install the cross linker:\n```\napt install gcc-aarch64-linux-gnu\n```"),
            reply("t", "q", "u1", 1_700_000_200, "That fixed it, thanks!"),
        ];
        let results = classify_all(&messages);
        let has = |id: &str, kind| results.iter().any(|c| c.message_id == id && c.kind == kind);
        assert!(has("q", ClassificationType::Question));
        assert!(has("a", ClassificationType::Answer));
        assert!(has("a", ClassificationType::Solution));
        assert!(has("t", ClassificationType::Acknowledgment));
        assert!(!has("q", ClassificationType::Answer));
    }
}
