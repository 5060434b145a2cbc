use anyhow::{bail, Context};
use candle_core::{Device, Result, Tensor};
use flate2::bufread::GzDecoder;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::Path;
use tokenizers::pre_tokenizers::whitespace::Whitespace;
use tokenizers::{OffsetReferential, OffsetType, PreTokenizedString, PreTokenizer};

const HF_PREFIX: &str = "hf://";
const HF_VOCAB_FILE: &str = "0_WordEmbeddings/whitespacetokenizer_config.json";
const HF_WEIGHTS_FILE: &str = "0_WordEmbeddings/pytorch_model.bin";
const HF_WEIGHTS_NAME: &str = "emb_layer.weight";

/// Opens `path` for reading, transparently gunzipping `.gz` files.
pub fn open_maybe_gz(path: &Path) -> anyhow::Result<Box<dyn BufRead>> {
    let file =
        File::open(path).with_context(|| format!("cannot open '{}'", path.display()))?;
    let bufreader = BufReader::new(file);
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(BufReader::new(GzDecoder::new(bufreader))))
    } else {
        Ok(Box::new(bufreader))
    }
}

#[derive(Deserialize)]
struct HubVocab {
    vocab: Vec<String>,
    #[serde(default)]
    do_lower_case: bool,
}

/// Frozen word vectors used to featurize comments.
///
/// The table lives on the CPU; `lookup` gathers rows and callers move the
/// result to the training device.
pub struct WordVectors {
    vocab: HashMap<String, u32>,
    table: Tensor,
    dim: usize,
    lowercase: bool,
    pre_tokenizer: Whitespace,
}

impl WordVectors {
    /// Loads vectors from a local GloVe-style text file or from `hf://<repo>`.
    pub fn load(source: &str, lowercase: bool) -> anyhow::Result<Self> {
        match source.strip_prefix(HF_PREFIX) {
            Some(repo) => Self::from_hub(repo, lowercase),
            None => {
                let reader = open_maybe_gz(Path::new(source))?;
                Self::from_text(reader, lowercase)
                    .with_context(|| format!("cannot read word vectors from '{source}'"))
            }
        }
    }

    /// Parses `word v1 .. vD` lines. A leading `count dim` header is skipped.
    pub fn from_text<R: BufRead>(reader: R, lowercase: bool) -> anyhow::Result<Self> {
        let mut vocab = HashMap::new();
        let mut data: Vec<f32> = Vec::new();
        let mut dim = 0;

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let mut parts = line.split_whitespace();
            let Some(word) = parts.next() else {
                continue;
            };
            let values = parts
                .map(|v| v.parse::<f32>())
                .collect::<std::result::Result<Vec<_>, _>>();
            let values = match values {
                Ok(values) => values,
                Err(e) => bail!("line {}: {e}", line_no + 1),
            };
            // word2vec header: "<count> <dim>"
            if line_no == 0 && values.len() == 1 && word.parse::<usize>().is_ok() {
                continue;
            }
            if dim == 0 {
                dim = values.len();
            }
            if values.is_empty() || values.len() != dim {
                bail!(
                    "line {}: expected {dim} components, found {}",
                    line_no + 1,
                    values.len()
                );
            }
            let word = if lowercase { word.to_lowercase() } else { word.to_string() };
            if vocab.contains_key(&word) {
                continue;
            }
            vocab.insert(word, vocab.len() as u32);
            data.extend(values);
        }

        if vocab.is_empty() {
            bail!("no word vectors found");
        }
        let table = Tensor::from_vec(data, (vocab.len(), dim), &Device::Cpu)?;
        Ok(Self::new(vocab, table, lowercase)?)
    }

    fn from_hub(repo: &str, lowercase: bool) -> anyhow::Result<Self> {
        tracing::info!("Fetching word vectors from the hub: {repo}");
        let api = hf_hub::api::sync::Api::new()?;
        let repo = api.model(repo.to_string());
        let vocab_path = repo.get(HF_VOCAB_FILE)?;
        let weights_path = repo.get(HF_WEIGHTS_FILE)?;

        let hub_vocab: HubVocab = serde_json::from_reader(BufReader::new(
            File::open(&vocab_path)
                .with_context(|| format!("cannot open '{}'", vocab_path.display()))?,
        ))?;
        if hub_vocab.do_lower_case != lowercase {
            tracing::warn!(
                "hub vocabulary has do_lower_case={}, lowercasing set to {lowercase}",
                hub_vocab.do_lower_case
            );
        }
        let table = candle_core::pickle::read_all(&weights_path)?
            .into_iter()
            .find_map(|(name, t)| (name == HF_WEIGHTS_NAME).then_some(t))
            .with_context(|| format!("'{HF_WEIGHTS_NAME}' missing from checkpoint"))?
            .to_dtype(candle_core::DType::F32)?;
        Ok(Self::from_word_list(hub_vocab.vocab, table, lowercase)?)
    }

    /// Row `i` of `table` is the vector of `words[i]`.
    fn from_word_list(words: Vec<String>, table: Tensor, lowercase: bool) -> Result<Self> {
        let vocab = words
            .into_iter()
            .enumerate()
            .map(|(i, w)| (w, i as u32))
            .collect();
        Self::new(vocab, table, lowercase)
    }

    fn new(vocab: HashMap<String, u32>, table: Tensor, lowercase: bool) -> Result<Self> {
        let (_, dim) = table.dims2()?;
        Ok(Self {
            vocab,
            table,
            dim,
            lowercase,
            pre_tokenizer: Whitespace::default(),
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.vocab.len()
    }

    /// Splits `text` into words and keeps the ids of the known ones.
    pub fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        let text = if self.lowercase { text.to_lowercase() } else { text.to_string() };
        let mut pretokenized = PreTokenizedString::from(text.as_str());
        self.pre_tokenizer
            .pre_tokenize(&mut pretokenized)
            .map_err(anyhow::Error::msg)?;
        Ok(pretokenized
            .get_splits(OffsetReferential::Original, OffsetType::Byte)
            .into_iter()
            .filter_map(|(word, _, _)| self.vocab.get(word).copied())
            .collect())
    }

    /// Gathers the vectors of `ids` into a `(ids.len(), dim)` tensor.
    pub fn lookup(&self, ids: &[u32]) -> Result<Tensor> {
        let ids = Tensor::new(ids, self.table.device())?;
        self.table.index_select(&ids, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const VECTORS: &str = "the 0.1 0.2 0.3\ncat 1.0 0.0 -1.0\nsat 0.5 0.5 0.5\n";

    #[test]
    fn encode_drops_unknown_words() -> anyhow::Result<()> {
        let wv = WordVectors::from_text(Cursor::new(VECTORS), true)?;
        assert_eq!(wv.dim(), 3);
        assert_eq!(wv.len(), 3);
        assert_eq!(wv.encode("The cat, quietly, SAT!")?, vec![0, 1, 2]);
        assert!(wv.encode("nothing known here")?.is_empty());
        Ok(())
    }

    #[test]
    fn lookup_gathers_rows() -> anyhow::Result<()> {
        let wv = WordVectors::from_text(Cursor::new(VECTORS), true)?;
        let rows = wv.lookup(&[1, 0, 1])?;
        assert_eq!(rows.dims(), &[3, 3]);
        assert_eq!(rows.to_vec2::<f32>()?[2], vec![1.0, 0.0, -1.0]);
        Ok(())
    }

    #[test]
    fn word2vec_header_is_skipped() -> anyhow::Result<()> {
        let text = format!("3 3\n{VECTORS}");
        let wv = WordVectors::from_text(Cursor::new(text), false)?;
        assert_eq!(wv.len(), 3);
        Ok(())
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let text = "a 1 2 3\nb 1 2\n";
        let err = WordVectors::from_text(Cursor::new(text), false).err().unwrap();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn word_list_honours_case_setting() -> anyhow::Result<()> {
        let words = vec!["Reddit".to_string(), "reddit".to_string()];
        let table = Tensor::new(&[[1f32, 0.], [0., 1.]], &Device::Cpu)?;

        let keep_case = WordVectors::from_word_list(words.clone(), table.clone(), false)?;
        assert_eq!(keep_case.encode("Reddit reddit")?, vec![0, 1]);

        let lower = WordVectors::from_word_list(words, table, true)?;
        assert_eq!(lower.encode("Reddit reddit")?, vec![1, 1]);
        Ok(())
    }

    #[test]
    fn empty_table_is_rejected() {
        assert!(WordVectors::from_text(Cursor::new(""), false).is_err());
    }

    #[test]
    fn gzipped_files_are_decoded() -> anyhow::Result<()> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("vectors.txt.gz");
        let mut enc = GzEncoder::new(File::create(&path)?, Compression::default());
        enc.write_all(VECTORS.as_bytes())?;
        enc.finish()?;

        let wv = WordVectors::load(path.to_str().unwrap(), true)?;
        assert_eq!(wv.encode("cat")?, vec![1]);
        Ok(())
    }
}
