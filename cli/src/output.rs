//! Where result lines go: stdout or `-O <file>`, framed by the optional
//! header file, `--header-line` and footer file. In continuous daemon mode
//! the output file is rotated once a day, keeping `-R` old generations as
//! `<file>.0` (newest) to `<file>.<n-1>`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, TimeZone};

/// Text written at the top of every output file.
#[derive(Debug, Clone, Default)]
pub struct Header {
    pub file: Option<PathBuf>,
    /// `%I` is replaced by the output's inode, `%H` by the AFD id.
    pub line: Option<String>,
    pub afd_id: u32,
}

impl Header {
    fn render(&self, inode: u64) -> Result<String> {
        let mut text = String::new();
        if let Some(path) = &self.file {
            text = fs::read_to_string(path).with_context(|| format!("Failed to read header file {}", path.display()))?;
        }
        if let Some(line) = &self.line {
            text.push_str(
                &line
                    .replace("%I", &inode.to_string())
                    .replace("%H", &format!("{:x}", self.afd_id)),
            );
            text.push('\n');
        }
        Ok(text)
    }
}

enum Target {
    Stdout(io::Stdout),
    File { path: PathBuf, out: BufWriter<File> },
}

pub struct OutputSink {
    target: Target,
    header: Header,
    footer: Option<PathBuf>,
    /// Generations kept when rotating daily; `None` never rotates.
    keep: Option<u32>,
    day: Option<NaiveDate>,
}

fn local_day(t: i64) -> Option<NaiveDate> {
    Local.timestamp_opt(t, 0).single().map(|d| d.date_naive())
}

fn open_append(path: &Path) -> Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open output file {}", path.display()))?;
    Ok(BufWriter::new(file))
}

impl OutputSink {
    pub fn new(path: Option<&Path>, header: Header, footer: Option<PathBuf>) -> Result<Self> {
        let target = match path {
            Some(path) => Target::File {
                path: path.to_path_buf(),
                out: open_append(path)?,
            },
            None => Target::Stdout(io::stdout()),
        };
        Ok(Self {
            target,
            header,
            footer,
            keep: None,
            day: None,
        })
    }

    /// Rotate daily, keeping `keep` old files. Only file output rotates.
    pub fn with_rotation(mut self, keep: u32, now: i64) -> Self {
        self.keep = Some(keep);
        self.day = local_day(now);
        self
    }

    fn inode(&self) -> u64 {
        match &self.target {
            Target::File { out, .. } => out.get_ref().metadata().map(|m| m.ino()).unwrap_or(0),
            Target::Stdout(_) => fs::metadata("/dev/stdout").map(|m| m.ino()).unwrap_or(0),
        }
    }

    fn out(&mut self) -> &mut dyn Write {
        match &mut self.target {
            Target::Stdout(out) => out,
            Target::File { out, .. } => out,
        }
    }

    pub fn write_header(&mut self) -> Result<()> {
        let text = self.header.render(self.inode())?;
        self.out().write_all(text.as_bytes()).context("Failed to write header")
    }

    pub fn write_line(&mut self, line: &str) -> Result<()> {
        let out = self.out();
        out.write_all(line.as_bytes())
            .and_then(|_| out.write_all(b"\n"))
            .context("Failed to write result")
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out().flush().context("Failed to flush output")
    }

    /// Starts a new file when the local day changed since the last call.
    pub fn rotate_if_due(&mut self, now: i64) -> Result<bool> {
        let (Some(keep), Target::File { path, .. }) = (self.keep, &self.target) else {
            return Ok(false);
        };
        let today = local_day(now);
        if today == self.day {
            return Ok(false);
        }
        self.day = today;
        let path = path.clone();
        self.flush()?;
        rotate_files(&path, keep)?;
        self.target = Target::File {
            out: open_append(&path)?,
            path,
        };
        self.write_header()?;
        log::info!("Rotated output file");
        Ok(true)
    }

    /// Writes the footer file, if any, and flushes.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(path) = self.footer.clone() {
            let text = fs::read(&path).with_context(|| format!("Failed to read footer file {}", path.display()))?;
            self.out().write_all(&text).context("Failed to write footer")?;
        }
        self.flush()
    }
}

fn generation(path: &Path, n: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}", n));
    PathBuf::from(name)
}

/// `<file>.<keep-2>` … `<file>.0` move up one, `<file>` becomes `<file>.0`.
fn rotate_files(path: &Path, keep: u32) -> Result<()> {
    if keep == 0 {
        return fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()));
    }
    for n in (0..keep - 1).rev() {
        let from = generation(path, n);
        if from.exists() {
            fs::rename(&from, generation(path, n + 1))
                .with_context(|| format!("Failed to rotate {}", from.display()))?;
        }
    }
    fs::rename(path, generation(path, 0)).with_context(|| format!("Failed to rotate {}", path.display()))
}
