use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const HEADER: &str = "step,tag,value,wall_time";

/// Append-only scalar log, one `step,tag,value,wall_time` row per scalar.
pub struct ScalarWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl ScalarWriter {
    /// Opens `{log_dir}/scalars.csv`, creating the directory and header if
    /// needed. Existing rows are kept so resumed runs extend the same log.
    pub fn new(log_dir: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join("scalars.csv");
        let is_new = !path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut out = BufWriter::new(file);
        if is_new {
            writeln!(out, "{HEADER}")?;
            out.flush()?;
        }
        Ok(Self { path, out })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes every `(name, value)` under `{main_tag}/{name}` at `step`.
    pub fn add_scalars(
        &mut self,
        main_tag: &str,
        scalars: &[(&str, f64)],
        step: usize,
    ) -> std::io::Result<()> {
        let wall_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        for (name, value) in scalars {
            writeln!(self.out, "{step},{main_tag}/{name},{value},{wall_time:.3}")?;
        }
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_appended_under_one_header() -> std::io::Result<()> {
        let dir = tempfile::tempdir()?;
        let log_dir = dir.path().join("run");
        {
            let mut w = ScalarWriter::new(&log_dir)?;
            w.add_scalars("classifier/loss", &[("test", 0.5), ("train", 0.25)], 1)?;
        }
        let mut w = ScalarWriter::new(&log_dir)?;
        w.add_scalars("classifier/accuracy", &[("test", 1.0)], 2)?;

        let text = fs::read_to_string(w.path())?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], HEADER);
        assert!(lines[1].starts_with("1,classifier/loss/test,0.5,"));
        assert!(lines[2].starts_with("1,classifier/loss/train,0.25,"));
        assert!(lines[3].starts_with("2,classifier/accuracy/test,1,"));
        Ok(())
    }
}
