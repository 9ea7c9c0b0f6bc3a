use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::path::Path;

use crate::config::DataFormat;
use crate::io as file_io;
use crate::tokenizer::Tokenizer;

/// A flat token stream cut into overlapping next-token windows.
pub struct Dataset {
    tokens: Vec<u32>,
    seq_len: usize,
}

impl Dataset {
    pub fn new(tokens: Vec<u32>, seq_len: usize) -> Self {
        Self { tokens, seq_len }
    }

    pub fn from_documents<S: AsRef<str>>(
        documents: &[S],
        tokenizer: &Tokenizer,
        seq_len: usize,
    ) -> Result<Self> {
        let mut all_tokens = Vec::new();
        for document in documents {
            all_tokens.extend(tokenizer.encode(document.as_ref())?);
            if let Some(eos) = tokenizer.eos_token_id() {
                all_tokens.push(eos);
            }
        }
        Ok(Self::new(all_tokens, seq_len))
    }

    /// Load a corpus file. Supports .gz and .zst/.zstd compressed files.
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        format: DataFormat,
        text_field: &str,
        tokenizer: &Tokenizer,
        seq_len: usize,
    ) -> Result<Self> {
        let documents = file_io::read_documents(path, format, text_field)?;
        Self::from_documents(&documents, tokenizer, seq_len)
    }

    /// Number of windows; window `i` predicts `tokens[i + 1..=i + seq_len]`.
    pub fn len(&self) -> usize {
        self.tokens.len().saturating_sub(self.seq_len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn max_token(&self) -> Option<u32> {
        self.tokens.iter().copied().max()
    }

    pub fn get_batch(&self, indices: &[usize], device: &Device) -> Result<(Tensor, Tensor)> {
        let batch_size = indices.len();
        let mut input_data = Vec::with_capacity(batch_size * self.seq_len);
        let mut target_data = Vec::with_capacity(batch_size * self.seq_len);

        for &start in indices {
            if start >= self.len() {
                anyhow::bail!("window {} out of range for {} windows", start, self.len());
            }
            let end = start + self.seq_len;
            input_data.extend_from_slice(&self.tokens[start..end]);
            target_data.extend_from_slice(&self.tokens[start + 1..end + 1]);
        }

        let input = Tensor::from_vec(input_data, (batch_size, self.seq_len), device)?
            .to_dtype(DType::U32)?;
        let target = Tensor::from_vec(target_data, (batch_size, self.seq_len), device)?
            .to_dtype(DType::U32)?;

        Ok((input, target))
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }
}

pub struct DataLoader {
    dataset: Dataset,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
    indices: Vec<usize>,
    current_pos: usize,
}

impl DataLoader {
    pub fn new(dataset: Dataset, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        let len = dataset.len();
        let indices: Vec<usize> = (0..len).collect();
        Self {
            dataset,
            batch_size,
            shuffle,
            rng: StdRng::seed_from_u64(seed),
            indices,
            current_pos: 0,
        }
    }

    pub fn reset(&mut self) {
        self.current_pos = 0;
        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len() / self.batch_size
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn next_batch(&mut self, device: &Device) -> Result<Option<(Tensor, Tensor)>> {
        if self.current_pos + self.batch_size > self.indices.len() {
            return Ok(None);
        }

        let batch_indices = &self.indices[self.current_pos..self.current_pos + self.batch_size];
        let batch = self.dataset.get_batch(batch_indices, device)?;
        self.current_pos += self.batch_size;
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_are_shifted_by_one() {
        let dataset = Dataset::new((0..10).collect(), 4);
        assert_eq!(dataset.len(), 6);

        let (input, target) = dataset.get_batch(&[0, 5], &Device::Cpu).unwrap();
        assert_eq!(input.dims(), &[2, 4]);
        assert_eq!(
            input.to_vec2::<u32>().unwrap(),
            vec![vec![0, 1, 2, 3], vec![5, 6, 7, 8]]
        );
        assert_eq!(
            target.to_vec2::<u32>().unwrap(),
            vec![vec![1, 2, 3, 4], vec![6, 7, 8, 9]]
        );
        assert!(dataset.get_batch(&[6], &Device::Cpu).is_err());
    }

    #[test]
    fn test_short_stream_is_empty() {
        let dataset = Dataset::new(vec![1, 2, 3], 3);
        assert!(dataset.is_empty());
        let mut loader = DataLoader::new(dataset, 1, true, 0);
        loader.reset();
        assert!(loader.next_batch(&Device::Cpu).unwrap().is_none());
    }

    #[test]
    fn test_documents_are_byte_tokens() {
        let tokenizer = Tokenizer::bytes();
        let dataset = Dataset::from_documents(&["ab", "cd"], &tokenizer, 2).unwrap();
        assert_eq!(dataset.tokens(), &[97, 98, 99, 100]);
        assert_eq!(dataset.max_token(), Some(100));
    }

    #[test]
    fn test_loader_yields_full_batches_only() {
        let dataset = Dataset::new((0..13).collect(), 3);
        let mut loader = DataLoader::new(dataset, 4, false, 0);
        assert_eq!(loader.num_batches(), 2);

        loader.reset();
        let mut batches = 0;
        while let Some((input, _)) = loader.next_batch(&Device::Cpu).unwrap() {
            assert_eq!(input.dims(), &[4, 3]);
            batches += 1;
        }
        assert_eq!(batches, 2);
    }

    #[test]
    fn test_shuffle_is_seeded() {
        let first_batch = |seed| {
            let dataset = Dataset::new((0..200).collect(), 2);
            let mut loader = DataLoader::new(dataset, 8, true, seed);
            loader.reset();
            let (input, _) = loader.next_batch(&Device::Cpu).unwrap().unwrap();
            input.to_vec2::<u32>().unwrap()
        };
        assert_eq!(first_batch(7), first_batch(7));
        assert_ne!(first_batch(7), first_batch(8));
    }
}
