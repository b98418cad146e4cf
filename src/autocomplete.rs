//! Cross-source lookup: query ICD and NAMASTE, then have the matcher pair them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::icd::{IcdClient, IcdMatch};
use crate::index::namaste::{NamasteHit, NamasteIndex, RebuildReport};
use crate::matcher::Matcher;

const PROMPT_TEMPLATE: &str = r#"
Here is the ICD response: {icd}
Here is the NAMASTE response: {namaste}
I want you to carefully match the corresponding diseases from both responses according to the similarity of their descriptions.
Return the final output strictly in the following JSON format only:
{
  "diseases": [
    {
      "icd": {
        "id": "string",
        "name": "string"
      },
      "namaste": {
        "type": "string",
        "id": "string",
        "name": "string",
        "desc": "string"
      }
    }
  ]
}
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcdRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamasteRef {
    #[serde(rename = "type")]
    pub category: String,
    pub id: String,
    pub name: String,
    #[serde(rename = "desc", default)]
    pub description: String,
}

/// One ICD entry paired with the NAMASTE entry the matcher judged equivalent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedPair {
    pub icd: IcdRef,
    pub namaste: NamasteRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Matches {
    pub diseases: Vec<MatchedPair>,
}

pub struct AutoComplete {
    icd: Arc<IcdClient>,
    namaste: Arc<NamasteIndex>,
    matcher: Arc<dyn Matcher>,
}

impl AutoComplete {
    pub fn new(
        icd: Arc<IcdClient>,
        namaste: Arc<NamasteIndex>,
        matcher: Arc<dyn Matcher>,
    ) -> Self {
        Self {
            icd,
            namaste,
            matcher,
        }
    }

    /// Looks `query` up in both vocabularies and returns the matcher's pairing.
    ///
    /// Either lookup failing fails the call. `cancel` is honoured while the
    /// matcher is working.
    pub async fn find(&self, cancel: &CancellationToken, query: &str) -> Result<Matches> {
        let (icd_matches, namaste_matches) =
            tokio::try_join!(self.icd.find(query), self.namaste.find(query))?;

        tracing::debug!(?icd_matches, "icd matches");
        tracing::debug!(?namaste_matches, "namaste matches");

        let prompt = build_prompt(&icd_matches, &namaste_matches);
        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
            reply = self.matcher.complete(&prompt) => reply?,
        };

        let matches = parse_reply(&reply)?;
        tracing::info!(
            "query {:?}: {} icd, {} namaste, {} pairs",
            query,
            icd_matches.len(),
            namaste_matches.len(),
            matches.diseases.len()
        );
        Ok(matches)
    }

    /// Rebuilds the local NAMASTE index. ICD data is remote and not refreshed.
    pub async fn update(&self) -> Result<RebuildReport> {
        self.namaste.rebuild().await
    }
}

pub fn build_prompt(icd: &[IcdMatch], namaste: &[NamasteHit]) -> String {
    let icd_json = serde_json::to_string_pretty(icd).unwrap_or_else(|_| "[]".to_string());
    let namaste_json = serde_json::to_string_pretty(namaste).unwrap_or_else(|_| "[]".to_string());
    PROMPT_TEMPLATE
        .replacen("{icd}", &icd_json, 1)
        .replacen("{namaste}", &namaste_json, 1)
}

/// Decodes the matcher's reply.
///
/// The reply is expected to be the JSON object wrapped in one leading and one
/// trailing line (a code fence), which are dropped. When that does not decode,
/// the first balanced JSON object anywhere in the reply is tried instead.
pub fn parse_reply(reply: &str) -> Result<Matches> {
    let inner = strip_outer_lines(reply);
    let primary = match serde_json::from_str::<Matches>(&inner) {
        Ok(matches) => return Ok(matches),
        Err(e) => e,
    };

    let source = match first_json_object(reply) {
        Some(object) => match serde_json::from_str::<Matches>(object) {
            Ok(matches) => {
                tracing::debug!("matcher reply decoded from embedded object: {}", primary);
                return Ok(matches);
            }
            Err(e) => e,
        },
        None => primary,
    };

    tracing::warn!(
        "matcher reply did not decode: {}",
        crate::error::truncate_for_log(reply)
    );
    Err(BridgeError::MatcherOutput { source })
}

fn strip_outer_lines(reply: &str) -> String {
    let lines: Vec<&str> = reply.split('\n').collect();
    if lines.len() <= 2 {
        return String::new();
    }
    lines[1..lines.len() - 1].join("\n")
}

fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
