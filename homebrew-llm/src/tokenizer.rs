use anyhow::Result;
use std::path::Path;
use tokenizers::Tokenizer as HfTokenizer;

const BYTE_VOCAB_SIZE: usize = 256;

/// End-of-document markers, in lookup order.
const EOS_TOKENS: [&str; 3] = ["<eos>", "</s>", "<|endoftext|>"];

fn hf_error(e: tokenizers::Error) -> anyhow::Error {
    anyhow::anyhow!("{}", e)
}

enum Inner {
    Bytes,
    Bpe(Box<HfTokenizer>),
}

/// Maps text to model input cases.
///
/// The byte-level variant needs no training and gives every UTF-8 byte its
/// own case; the BPE variant wraps a `tokenizers` JSON file.
pub struct Tokenizer {
    inner: Inner,
    eos_token_id: Option<u32>,
}

impl Tokenizer {
    pub fn bytes() -> Self {
        Self {
            inner: Inner::Bytes,
            eos_token_id: None,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let inner = HfTokenizer::from_file(path).map_err(hf_error)?;
        Self::from_hf(inner)
    }

    fn from_hf(inner: HfTokenizer) -> Result<Self> {
        if inner.get_vocab_size(true) == 0 {
            anyhow::bail!("tokenizer has an empty vocabulary");
        }
        let eos_token_id = EOS_TOKENS
            .iter()
            .find_map(|token| inner.token_to_id(token));
        Ok(Self {
            inner: Inner::Bpe(Box::new(inner)),
            eos_token_id,
        })
    }

    /// Loads `path` when given, otherwise falls back to byte-level tokens.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::bytes()),
        }
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        match &self.inner {
            Inner::Bytes => Ok(text.bytes().map(u32::from).collect()),
            Inner::Bpe(tokenizer) => {
                let encoding = tokenizer.encode(text, false).map_err(hf_error)?;
                Ok(encoding.get_ids().to_vec())
            }
        }
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        match &self.inner {
            Inner::Bytes => {
                let bytes = ids
                    .iter()
                    .map(|&id| {
                        u8::try_from(id)
                            .map_err(|_| anyhow::anyhow!("token {} is not a byte", id))
                    })
                    .collect::<Result<Vec<u8>>>()?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            Inner::Bpe(tokenizer) => tokenizer.decode(ids, true).map_err(hf_error),
        }
    }

    pub fn vocab_size(&self) -> usize {
        match &self.inner {
            Inner::Bytes => BYTE_VOCAB_SIZE,
            Inner::Bpe(tokenizer) => tokenizer.get_vocab_size(true),
        }
    }

    /// Separator appended after every document, if the vocabulary has one.
    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    pub fn is_byte_level(&self) -> bool {
        matches!(self.inner, Inner::Bytes)
    }
}

/// Trains a byte-level BPE vocabulary with this crate's special tokens.
pub struct BPETrainer {
    vocab_size: usize,
    min_frequency: u64,
    special_tokens: Vec<String>,
}

impl BPETrainer {
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            min_frequency: 2,
            special_tokens: ["<pad>", "<bos>", "<eos>", "<unk>"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    pub fn with_min_frequency(mut self, freq: u32) -> Self {
        self.min_frequency = freq.into();
        self
    }

    /// Special tokens take the first ids, in the given order.
    pub fn with_special_tokens<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.special_tokens = tokens.into_iter().map(Into::into).collect();
        self
    }

    /// Trains on the lines of `files`, which may be gzip or zstd compressed.
    pub fn train_from_files<P: AsRef<Path>>(
        &self,
        files: &[P],
        output_path: &Path,
    ) -> Result<Tokenizer> {
        let mut lines = Vec::new();
        for file in files {
            let content = crate::io::read_to_string(file)?;
            lines.extend(content.lines().map(str::to_string));
        }
        let texts: Vec<&str> = lines.iter().map(String::as_str).collect();
        self.train_from_texts(&texts, output_path)
    }

    /// Trains on `texts`, writes the tokenizer JSON to `output_path` and
    /// returns it ready for encoding.
    pub fn train_from_texts(&self, texts: &[&str], output_path: &Path) -> Result<Tokenizer> {
        let fitted = self.fit(texts)?;
        fitted.save(output_path, true).map_err(hf_error)?;
        let tokenizer = Tokenizer::from_hf(fitted)?;
        if tokenizer.eos_token_id().is_none() {
            tracing::warn!(
                "{} has no end-of-document token; documents will be concatenated directly",
                output_path.display()
            );
        }
        Ok(tokenizer)
    }

    fn fit(&self, texts: &[&str]) -> Result<HfTokenizer> {
        use tokenizers::AddedToken;
        use tokenizers::models::bpe::{BPE, BpeTrainerBuilder};
        use tokenizers::pre_tokenizers::byte_level::ByteLevel;
        use tokenizers::tokenizer::Trainer;

        let specials: Vec<AddedToken> = self
            .special_tokens
            .iter()
            .map(|token| AddedToken::from(token.clone(), true))
            .collect();

        let mut bpe_trainer = BpeTrainerBuilder::default()
            .vocab_size(self.vocab_size)
            .min_frequency(self.min_frequency)
            .special_tokens(specials.clone())
            .build();
        bpe_trainer
            .feed(texts.iter().copied(), |text| Ok(vec![text.to_owned()]))
            .map_err(hf_error)?;

        let mut bpe = BPE::default();
        bpe_trainer.train(&mut bpe).map_err(hf_error)?;

        let mut fitted = HfTokenizer::new(bpe);
        fitted.with_pre_tokenizer(Some(ByteLevel::default()));
        fitted.add_special_tokens(&specials);
        Ok(fitted)
    }
}
