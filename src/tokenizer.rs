use std::path::{Path, PathBuf};

use tokenizers::Tokenizer;

use crate::error::TokenizerError;

pub const TOKENIZER_FILE_NAME: &str = "tokenizer.json";

pub type TokenId = u32;

/// Used when the vocabulary names none of the usual end markers.
const FALLBACK_END_ID: TokenId = 2;

const END_MARKERS: [&str; 4] = ["</s>", "<|end_of_text|>", "<|endoftext|>", "<|eot_id|>"];

/// Text <-> token ids for the engine's vocabulary. Read-only after load, so it
/// can be shared across threads for concurrent encode/decode.
pub struct TokenizerSession {
    tokenizer: Tokenizer,
    end_id: TokenId,
}

impl std::fmt::Debug for TokenizerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenizerSession")
            .field("end_id", &self.end_id)
            .field("vocab_size", &self.vocab_size())
            .finish()
    }
}

pub fn resolve_tokenizer_path(model_dir: &Path) -> Option<PathBuf> {
    if model_dir.is_file() {
        return Some(model_dir.to_path_buf());
    }

    let local = model_dir.join(TOKENIZER_FILE_NAME);
    if local.exists() {
        return Some(local);
    }

    // Engine builds sometimes keep the tokenizer next to the engine directory.
    let sibling = model_dir.parent()?.join(TOKENIZER_FILE_NAME);
    if sibling.exists() {
        return Some(sibling);
    }

    None
}

fn resolve_end_id(tokenizer: &Tokenizer) -> TokenId {
    END_MARKERS
        .iter()
        .find_map(|marker| tokenizer.token_to_id(marker))
        .unwrap_or(FALLBACK_END_ID)
}

impl TokenizerSession {
    pub fn initialize(model_dir: &Path) -> Result<Self, TokenizerError> {
        let path = resolve_tokenizer_path(model_dir).ok_or_else(|| TokenizerError::Load {
            path: model_dir.join(TOKENIZER_FILE_NAME),
            reason: "tokenizer.json not found".to_string(),
        })?;

        let tokenizer = Tokenizer::from_file(&path).map_err(|e| TokenizerError::Load {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let session = Self::from_tokenizer(tokenizer);
        tracing::info!(
            path = %path.display(),
            vocab_size = session.vocab_size(),
            end_id = session.end_id,
            "tokenizer ready"
        );
        Ok(session)
    }

    pub fn from_tokenizer(tokenizer: Tokenizer) -> Self {
        let end_id = resolve_end_id(&tokenizer);
        Self { tokenizer, end_id }
    }

    /// Encodes any text; only an internal tokenizer failure is an error.
    pub fn encode(&self, text: &str) -> Result<Vec<TokenId>, TokenizerError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| TokenizerError::Encode(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decodes ids back to text. Ids the vocabulary does not know are an error
    /// rather than being silently dropped.
    pub fn decode(&self, ids: &[TokenId]) -> Result<String, TokenizerError> {
        if let Some(&bad) = ids.iter().find(|&&id| self.tokenizer.id_to_token(id).is_none()) {
            return Err(TokenizerError::OutOfVocabulary(bad));
        }
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| TokenizerError::Decode(e.to_string()))
    }

    pub fn end_id(&self) -> TokenId {
        self.end_id
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}
