//! Several chunks per extraction prompt.

use anyhow::{Context, Result};
use llm::content_key;
use tracing::{debug, warn};

use crate::language::{Language, detect_language};
use crate::parser::parse_response;
use crate::prompt::{build_merged_extraction_prompt, text_marker};
use crate::schema::{CachedExtraction, Chunk, ExtractionOutput};
use crate::Extractor;

const MERGED_PREFIX: &str = "merged-extract-";

impl Extractor {
    /// Extract a group of chunks with one model call. Returns one output per
    /// chunk, in input order.
    pub async fn extract_merged(&self, chunks: &[Chunk]) -> Result<Vec<ExtractionOutput>> {
        match chunks {
            [] => return Ok(Vec::new()),
            [single] => return Ok(vec![self.extract(single).await?]),
            _ => {}
        }

        let joined = chunks
            .iter()
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let key = content_key(MERGED_PREFIX, &joined);

        if let Some(cache) = self.cache() {
            if let Some(raw) = cache.get_by_key(&key) {
                match serde_json::from_str::<Vec<CachedExtraction>>(&raw) {
                    Ok(cached) if cached.len() == chunks.len() => {
                        debug!(chunks = chunks.len(), "Merged extraction cache hit");
                        return Ok(cached
                            .into_iter()
                            .zip(chunks)
                            .map(|(entry, chunk)| entry.into_output().with_source(&chunk.id))
                            .collect());
                    }
                    _ => debug!("Ignoring unreadable merged extraction cache entry"),
                }
            }
        }

        let language = detect_language(&joined);
        let prompt = build_merged_extraction_prompt(language, chunks);
        let response = self
            .generator()
            .generate(&prompt)
            .await
            .with_context(|| format!("Failed to extract merged group of {} chunks", chunks.len()))?;

        let sections = split_sections(&response, language, chunks.len());
        let outputs: Vec<ExtractionOutput> = chunks
            .iter()
            .zip(sections)
            .map(|(chunk, section)| match section {
                Some(text) if !text.trim().is_empty() => parse_response(&text, &chunk.id),
                _ => {
                    warn!(chunk_id = %chunk.id, "No labelled section for chunk, parsing whole response");
                    parse_response(&response, &chunk.id)
                }
            })
            .collect();

        if let Some(cache) = self.cache() {
            let cached: Vec<CachedExtraction> = outputs
                .iter()
                .zip(chunks)
                .map(|(output, chunk)| output.to_cached(&chunk.id))
                .collect();
            if let Ok(json) = serde_json::to_string(&cached) {
                cache.set_by_key(key, json);
            }
        }

        Ok(outputs)
    }
}

/// Cut `response` into `count` sections by their `[Text i]` labels.
/// Lines without a label belong to the section opened last; text before the
/// first label belongs to none. A chunk whose label never appears gets `None`.
fn split_sections(response: &str, language: Language, count: usize) -> Vec<Option<String>> {
    let markers: Vec<(usize, String)> = (1..=count)
        .map(|i| (i - 1, text_marker(language, i)))
        .collect();

    let mut sections: Vec<Option<String>> = vec![None; count];
    let mut current: Option<usize> = None;

    for line in response.lines() {
        let labelled = markers
            .iter()
            .find_map(|(idx, marker)| line.find(marker.as_str()).map(|pos| (*idx, pos + marker.len())));

        let rest = match labelled {
            Some((idx, end)) => {
                current = Some(idx);
                &line[end..]
            }
            None => line,
        };

        if let Some(idx) = current {
            let section = sections[idx].get_or_insert_with(String::new);
            section.push_str(rest);
            section.push('\n');
        }
    }
    sections
}
