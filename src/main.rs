use std::path::PathBuf;

use anyhow::{Context, Result};
use chat_stats::{
    BasicTextProcessor, ChatStatistics, RankedUser, StopwordFilter, Transcript, WordFrequency, HP,
};
use clap::{ArgGroup, Parser};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "chat-stats",
    about = "Top question repliers and a word-cloud corpus from a chat export",
    version
)]
#[command(group(ArgGroup::new("filter").required(true).args(["stopwords", "no_stopwords"])))]
struct Cli {
    /// Chat export (JSON with a `messages` array)
    chat_json: PathBuf,

    /// Stopword list, one word per line
    #[arg(long, value_name = "PATH")]
    stopwords: Option<PathBuf>,

    /// Build the corpus without any stopword filtering
    #[arg(long)]
    no_stopwords: bool,

    /// Number of repliers to report
    #[arg(long, default_value_t = HP.default_top_n)]
    top: usize,

    /// Character cap for the corpus
    #[arg(long, default_value_t = HP.default_max_chars)]
    max_chars: usize,

    /// Number of most frequent corpus words to report
    #[arg(long, default_value_t = HP.default_top_n)]
    words: usize,
}

#[derive(Serialize)]
struct Report {
    top_repliers: Vec<RankedUser>,
    corpus: String,
    word_frequencies: Vec<WordFrequency>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let processor = BasicTextProcessor;

    let transcript = Transcript::from_path(&cli.chat_json)?;
    let stopwords = match &cli.stopwords {
        Some(path) => StopwordFilter::from_path(path, &processor)?,
        None => StopwordFilter::empty(),
    };
    let stats = ChatStatistics::new(transcript, stopwords, processor);

    let report = Report {
        top_repliers: stats.get_top_repliers_to_questions(cli.top),
        corpus: stats.build_word_corpus(cli.max_chars),
        word_frequencies: stats.word_frequencies(cli.max_chars, cli.words),
    };

    let json = serde_json::to_string_pretty(&report).context("failed to serialize report")?;
    println!("{json}");
    Ok(())
}
