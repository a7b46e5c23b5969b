use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};
use unicode_segmentation::UnicodeSegmentation;

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Transcript {
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub id: i64,
    #[serde(default)]
    pub from: Option<String>,
    /// A missing `text` field reads as an empty plain body.
    #[serde(default)]
    pub text: MessageBody,
    #[serde(default)]
    pub reply_to_message_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    Plain(String),
    Segmented(Vec<Fragment>),
}

impl Default for MessageBody {
    fn default() -> Self {
        MessageBody::Plain(String::new())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Fragment {
    Literal(String),
    Entity(Map<String, Value>),
}

impl Fragment {
    pub fn text(&self) -> Option<&str> {
        match self {
            Fragment::Literal(text) => Some(text.as_str()),
            Fragment::Entity(fields) => fields.get("text").and_then(Value::as_str),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage<'a> {
    pub id: i64,
    pub from: Option<&'a str>,
    pub text: Cow<'a, str>,
    pub reply_to_message_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedUser {
    pub user: String,
    pub replies: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WordFrequency {
    pub word: String,
    pub count: usize,
}

// ---------------------------------------------------------------------------
// Hyperparameters
// ---------------------------------------------------------------------------

pub struct Hyperparameters {
    pub question_markers: &'static [char],
    pub default_top_n: usize,
    pub default_max_chars: usize,
    pub word_cloud_width: u32,
    pub word_cloud_height: u32,
    pub word_cloud_max_font_size: u32,
    pub word_cloud_background: &'static str,
    pub word_cloud_file_name: &'static str,
}

pub static HP: Hyperparameters = Hyperparameters {
    question_markers: &['?', '\u{061F}'],
    default_top_n: 10,
    default_max_chars: 1000,
    word_cloud_width: 1200,
    word_cloud_height: 1200,
    word_cloud_max_font_size: 200,
    word_cloud_background: "white",
    word_cloud_file_name: "wordcloud.png",
};

// ---------------------------------------------------------------------------
// Compiled patterns
// ---------------------------------------------------------------------------

// Terminators stay attached to the sentence they close.
static SENTENCE_END_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?\u{061F}\u{2E2E}]+(?:\s+|$)|\n+").unwrap());

// ---------------------------------------------------------------------------
// Text processing
// ---------------------------------------------------------------------------

pub trait TextProcessor {
    /// Must be idempotent.
    fn normalize(&self, text: &str) -> String;
    fn tokenize(&self, text: &str) -> Vec<String>;
    fn split_sentences(&self, text: &str) -> Vec<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BasicTextProcessor;

impl TextProcessor for BasicTextProcessor {
    fn normalize(&self, text: &str) -> String {
        let unified: String = text
            .chars()
            .filter_map(|c| match c {
                '\u{064A}' | '\u{0649}' => Some('\u{06CC}'),
                '\u{0643}' => Some('\u{06A9}'),
                c if is_arabic_mark(c) => None,
                c => Some(c),
            })
            .collect();
        unified
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn tokenize(&self, text: &str) -> Vec<String> {
        text.unicode_words().map(str::to_string).collect()
    }

    fn split_sentences(&self, text: &str) -> Vec<String> {
        let mut sentences = Vec::new();
        let mut start = 0;
        for m in SENTENCE_END_RE.find_iter(text) {
            push_sentence(&mut sentences, &text[start..m.end()]);
            start = m.end();
        }
        push_sentence(&mut sentences, &text[start..]);
        sentences
    }
}

// harakat, superscript alef, tatweel
fn is_arabic_mark(c: char) -> bool {
    matches!(c, '\u{064B}'..='\u{065F}' | '\u{0670}' | '\u{0640}')
}

fn push_sentence(sentences: &mut Vec<String>, raw: &str) {
    let sentence = raw.trim();
    if !sentence.is_empty() {
        sentences.push(sentence.to_string());
    }
}

// ---------------------------------------------------------------------------
// Message normalizer
// ---------------------------------------------------------------------------

pub fn reconstruct(body: &MessageBody) -> Cow<'_, str> {
    match body {
        MessageBody::Plain(text) => Cow::Borrowed(text.as_str()),
        MessageBody::Segmented(fragments) => {
            Cow::Owned(fragments.iter().filter_map(Fragment::text).collect())
        }
    }
}

pub fn normalize_messages(messages: &[Message]) -> Vec<NormalizedMessage<'_>> {
    messages
        .iter()
        .map(|msg| NormalizedMessage {
            id: msg.id,
            from: msg.from.as_deref(),
            text: reconstruct(&msg.text),
            reply_to_message_id: msg.reply_to_message_id,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Stopwords
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StopwordFilter {
    stopwords: FxHashSet<String>,
}

impl StopwordFilter {
    pub fn empty() -> Self {
        Self {
            stopwords: FxHashSet::default(),
        }
    }

    pub fn from_lines<P: TextProcessor + ?Sized>(raw: &str, processor: &P) -> Self {
        let stopwords = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| processor.normalize(line))
            .filter(|word| !word.is_empty())
            .collect();
        Self { stopwords }
    }

    pub fn from_path<P: TextProcessor + ?Sized>(path: &Path, processor: &P) -> Result<Self> {
        info!(path = %path.display(), "loading stopwords");
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read stopword list {}", path.display()))?;
        let filter = Self::from_lines(&raw, processor);
        debug!(count = filter.len(), "stopwords loaded");
        Ok(filter)
    }

    pub fn is_stopword(&self, token: &str) -> bool {
        self.stopwords.contains(token)
    }

    pub fn len(&self) -> usize {
        self.stopwords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stopwords.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Question detection
// ---------------------------------------------------------------------------

pub fn has_question<P: TextProcessor + ?Sized>(text: &str, processor: &P) -> bool {
    if text.trim().is_empty() {
        return false;
    }
    processor
        .split_sentences(text)
        .iter()
        .any(|sentence| sentence.contains(HP.question_markers))
}

#[derive(Debug, Clone, Default)]
pub struct QuestionIndex {
    flags: FxHashMap<i64, bool>,
}

impl QuestionIndex {
    pub fn build<P: TextProcessor + ?Sized>(
        messages: &[NormalizedMessage<'_>],
        processor: &P,
    ) -> Self {
        let mut flags = FxHashMap::default();
        for msg in messages {
            let flag = flags.entry(msg.id).or_insert(false);
            if !*flag {
                *flag = has_question(&msg.text, processor);
            }
        }
        Self { flags }
    }

    pub fn is_question(&self, id: i64) -> bool {
        self.flags.get(&id).copied().unwrap_or(false)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.flags.contains_key(&id)
    }

    pub fn question_count(&self) -> usize {
        self.flags.values().filter(|flag| **flag).count()
    }

}

// ---------------------------------------------------------------------------
// Reply ranking
// ---------------------------------------------------------------------------

pub fn rank_repliers(
    messages: &[NormalizedMessage<'_>],
    questions: &QuestionIndex,
    top_n: usize,
) -> Vec<RankedUser> {
    if top_n == 0 {
        return Vec::new();
    }

    let mut tally: Vec<RankedUser> = Vec::new();
    let mut slots: FxHashMap<&str, usize> = FxHashMap::default();
    let mut dangling = 0usize;
    let mut senderless = 0usize;

    for msg in messages {
        let Some(target) = msg.reply_to_message_id else {
            continue;
        };
        if !questions.contains(target) {
            dangling += 1;
            continue;
        }
        if !questions.is_question(target) {
            continue;
        }
        let Some(sender) = msg.from else {
            senderless += 1;
            continue;
        };
        let slot = *slots.entry(sender).or_insert_with(|| {
            tally.push(RankedUser {
                user: sender.to_string(),
                replies: 0,
            });
            tally.len() - 1
        });
        tally[slot].replies += 1;
    }

    if dangling > 0 || senderless > 0 {
        debug!(dangling, senderless, "replies left out of the tally");
    }

    // sort_by is stable, so equal counts stay in first-scored order
    tally.sort_by(|a, b| b.replies.cmp(&a.replies));
    tally.truncate(top_n);
    tally
}

// ---------------------------------------------------------------------------
// Corpus
// ---------------------------------------------------------------------------

pub fn build_corpus<P: TextProcessor + ?Sized>(
    messages: &[NormalizedMessage<'_>],
    stopwords: &StopwordFilter,
    processor: &P,
    max_chars: usize,
) -> String {
    let mut buffer = String::new();
    for msg in messages {
        for token in processor.tokenize(&msg.text) {
            let token = processor.normalize(&token);
            if token.is_empty() || stopwords.is_stopword(&token) {
                continue;
            }
            if !buffer.is_empty() {
                buffer.push(' ');
            }
            buffer.push_str(&token);
        }
    }

    let normalized = processor.normalize(truncate_chars(&buffer, max_chars));
    // normalization can lengthen some characters, so cap again
    let capped = truncate_chars(&normalized, max_chars);
    drop_cut_stopword(capped, stopwords).to_string()
}

// The cap can shorten the last token into a stopword ("beta" -> "be").
fn drop_cut_stopword<'a>(corpus: &'a str, stopwords: &StopwordFilter) -> &'a str {
    match corpus.rsplit_once(' ') {
        Some((head, last)) if stopwords.is_stopword(last) => head,
        None if stopwords.is_stopword(corpus) => "",
        _ => corpus,
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub fn word_frequencies(corpus: &str, top_n: usize) -> Vec<WordFrequency> {
    let mut counts: Vec<WordFrequency> = Vec::new();
    let mut slots: FxHashMap<&str, usize> = FxHashMap::default();
    for word in corpus.split_whitespace() {
        let slot = *slots.entry(word).or_insert_with(|| {
            counts.push(WordFrequency {
                word: word.to_string(),
                count: 0,
            });
            counts.len() - 1
        });
        counts[slot].count += 1;
    }
    counts.sort_by(|a, b| b.count.cmp(&a.count));
    counts.truncate(top_n);
    counts
}

// ---------------------------------------------------------------------------
// Word cloud
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WordCloudConfig {
    pub width: u32,
    pub height: u32,
    pub max_font_size: u32,
    pub background_color: String,
    pub font_path: Option<PathBuf>,
}

impl Default for WordCloudConfig {
    fn default() -> Self {
        Self {
            width: HP.word_cloud_width,
            height: HP.word_cloud_height,
            max_font_size: HP.word_cloud_max_font_size,
            background_color: HP.word_cloud_background.to_string(),
            font_path: None,
        }
    }
}

impl WordCloudConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read word cloud config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid word cloud config {}", path.display()))
    }
}

/// Draws a corpus and returns the encoded image.
pub trait WordCloudRenderer {
    fn render(&self, corpus: &str, config: &WordCloudConfig) -> Result<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

impl Transcript {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("chat export is not a valid transcript")
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        info!(path = %path.display(), "loading chat data");
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read chat export {}", path.display()))?;
        let transcript = Self::from_json_str(&raw)
            .with_context(|| format!("failed to parse chat export {}", path.display()))?;
        debug!(messages = transcript.messages.len(), "chat data loaded");
        Ok(transcript)
    }
}

#[derive(Debug, Clone)]
pub struct ChatStatistics<P = BasicTextProcessor> {
    transcript: Transcript,
    stopwords: StopwordFilter,
    processor: P,
}

impl ChatStatistics<BasicTextProcessor> {
    /// Load a chat export and a stopword list with the built-in processor.
    pub fn load(chat_json: impl AsRef<Path>, stopwords: impl AsRef<Path>) -> Result<Self> {
        Self::load_with(chat_json, stopwords, BasicTextProcessor)
    }
}

impl<P: TextProcessor> ChatStatistics<P> {
    pub fn new(transcript: Transcript, stopwords: StopwordFilter, processor: P) -> Self {
        Self {
            transcript,
            stopwords,
            processor,
        }
    }

    pub fn load_with(
        chat_json: impl AsRef<Path>,
        stopwords: impl AsRef<Path>,
        processor: P,
    ) -> Result<Self> {
        let transcript = Transcript::from_path(chat_json.as_ref())?;
        let stopwords = StopwordFilter::from_path(stopwords.as_ref(), &processor)?;
        Ok(Self::new(transcript, stopwords, processor))
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn stopwords(&self) -> &StopwordFilter {
        &self.stopwords
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub fn normalized_messages(&self) -> Vec<NormalizedMessage<'_>> {
        normalize_messages(&self.transcript.messages)
    }

    pub fn question_index(&self) -> QuestionIndex {
        QuestionIndex::build(&self.normalized_messages(), &self.processor)
    }

    pub fn get_top_repliers_to_questions(&self, top_n: usize) -> Vec<RankedUser> {
        let messages = self.normalized_messages();
        let questions = QuestionIndex::build(&messages, &self.processor);
        info!(
            messages = messages.len(),
            questions = questions.question_count(),
            "ranking repliers to questions"
        );
        rank_repliers(&messages, &questions, top_n)
    }

    pub fn build_word_corpus(&self, max_chars: usize) -> String {
        info!(max_chars, "loading text content");
        let messages = self.normalized_messages();
        build_corpus(&messages, &self.stopwords, &self.processor, max_chars)
    }

    pub fn word_frequencies(&self, max_chars: usize, top_n: usize) -> Vec<WordFrequency> {
        word_frequencies(&self.build_word_corpus(max_chars), top_n)
    }

    /// Render the corpus and write it to `<output_dir>/wordcloud.png`.
    pub fn generate_word_cloud<R: WordCloudRenderer + ?Sized>(
        &self,
        renderer: &R,
        config: &WordCloudConfig,
        max_chars: usize,
        output_dir: impl AsRef<Path>,
    ) -> Result<PathBuf> {
        let corpus = self.build_word_corpus(max_chars);
        if corpus.is_empty() {
            bail!("no words left to draw after stopword filtering");
        }

        info!("generating word cloud");
        let image = renderer
            .render(&corpus, config)
            .context("word cloud renderer failed")?;

        let path = output_dir.as_ref().join(HP.word_cloud_file_name);
        fs::write(&path, image)
            .with_context(|| format!("failed to write word cloud {}", path.display()))?;
        info!(path = %path.display(), "word cloud written");
        Ok(path)
    }
}
