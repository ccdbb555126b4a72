use serde::{Deserialize, Serialize};

use crate::{Result, SlidecastError};

/// Combined line length after which the script chunker closes a slide.
pub const MAX_SLIDE_CHARS: usize = 140;

const READING_WORDS_PER_MINUTE: f64 = 150.0;
const MIN_READING_SECONDS: f64 = 10.0;

/// A single slide. `text` is already wrapped into lines separated by `\n`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slide {
    pub text: String,
    pub index: usize,
}

/// Ordered, immutable list of slides for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlideDeck {
    slides: Vec<Slide>,
}

impl SlideDeck {
    /// Builds a deck from slide texts. An empty list is a timing underflow
    /// and rejected here so it never reaches the timeline.
    pub fn new<I, S>(texts: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let slides: Vec<Slide> = texts
            .into_iter()
            .enumerate()
            .map(|(index, text)| Slide {
                text: text.into(),
                index,
            })
            .collect();

        if slides.is_empty() {
            return Err(SlidecastError::validation("at least one slide is required"));
        }

        Ok(Self { slides })
    }

    /// Derives the deck from free-form script text.
    pub fn from_script(script: &str) -> Self {
        let slides = slides_from_script(script)
            .into_iter()
            .enumerate()
            .map(|(index, text)| Slide { text, index })
            .collect();
        Self { slides }
    }

    pub fn len(&self) -> usize {
        self.slides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slides.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Slide> {
        self.slides.get(index)
    }

    pub fn first(&self) -> Option<&Slide> {
        self.slides.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slide> {
        self.slides.iter()
    }
}

/// Chunks script text into slide texts. Non-blank lines accumulate into the
/// current slide until their space-joined length exceeds
/// [`MAX_SLIDE_CHARS`]; lines within a slide stay separated by `\n`.
pub fn slides_from_script(script: &str) -> Vec<String> {
    let mut slides = Vec::new();
    let mut buffer: Vec<&str> = Vec::new();

    for line in script.lines().map(str::trim).filter(|l| !l.is_empty()) {
        buffer.push(line);
        if buffer.join(" ").len() > MAX_SLIDE_CHARS {
            slides.push(buffer.join("\n"));
            buffer.clear();
        }
    }
    if !buffer.is_empty() {
        slides.push(buffer.join("\n"));
    }

    if slides.is_empty() {
        slides.push("Untitled".to_string());
    }
    slides
}

/// Rough narration length for `text` at a conversational reading pace.
pub fn estimate_reading_seconds(text: &str) -> f64 {
    let words = text.split_whitespace().count() as f64;
    let seconds = (words / READING_WORDS_PER_MINUTE * 60.0).round();
    seconds.max(MIN_READING_SECONDS)
}
