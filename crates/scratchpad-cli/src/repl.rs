//! `scratchpad run`: line-oriented session on stdin/stdout.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use scratchpad_core::config::ScratchpadConfig;
use scratchpad_core::types::{ConnectionId, FileEntry, Origin, TransportState};
use scratchpad_sync::relay::HttpRelay;
use scratchpad_sync::{ClientHandle, JsonFileStore, KeyStore, ScratchpadClient, Snapshot, WsConnector};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

const HELP: &str = "type to replace the text; :append <text>, :file <path>, :rm <index>, :show, :quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Replace(String),
    Append(String),
    File(PathBuf),
    Remove(usize),
    Show,
    Quit,
}

pub fn parse_line(line: &str) -> Result<Input> {
    let Some(command) = line.strip_prefix(':') else {
        return Ok(Input::Replace(line.to_string()));
    };
    let (name, arg) = match command.split_once(' ') {
        Some((name, arg)) => (name, arg.trim()),
        None => (command.trim(), ""),
    };
    match name {
        "append" => Ok(Input::Append(arg.to_string())),
        "file" if !arg.is_empty() => Ok(Input::File(PathBuf::from(arg))),
        "file" => bail!(":file needs a path"),
        "rm" => arg
            .parse()
            .map(Input::Remove)
            .with_context(|| format!(":rm needs a file index, got '{arg}'")),
        "show" => Ok(Input::Show),
        "quit" | "q" => Ok(Input::Quit),
        other => bail!("unknown command ':{other}' ({HELP})"),
    }
}

pub async fn run(
    config: &ScratchpadConfig,
    mut store: KeyStore<JsonFileStore>,
    id: Option<ConnectionId>,
) -> Result<()> {
    // The client resumes the stored selection on start.
    match id {
        Some(id) => {
            store.add_connection(&id)?;
            store.set_current_connection(Some(&id))?;
        }
        None => {
            store
                .current_connection()?
                .context("no connection selected; pass an id or run `scratchpad connect <id>`")?;
        }
    }

    let relay = HttpRelay::new(&config.client)?;
    let (client, handle) = ScratchpadClient::new(config, store, WsConnector, relay);
    let task = tokio::spawn(client.run());
    let printer = tokio::spawn(print_remote_changes(handle.clone()));

    eprintln!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        let input = match parse_line(&line) {
            Ok(Input::Quit) => break,
            Ok(input) => input,
            Err(e) => {
                eprintln!("{e:#}");
                continue;
            }
        };
        if let Err(e) = apply(&handle, input).await {
            eprintln!("error: {e:#}");
        }
    }

    flush_before_exit(&handle, config).await;
    printer.abort();
    handle.shutdown().await?;
    task.await.context("client loop panicked")??;
    Ok(())
}

async fn apply(handle: &ClientHandle, input: Input) -> Result<()> {
    match input {
        Input::Replace(text) => handle.set_text(text).await?,
        Input::Append(line) => {
            let text = append_line(&handle.snapshot().text, &line);
            handle.set_text(text).await?
        }
        Input::File(path) => {
            let entry = read_file_entry(&path).await?;
            handle.add_file(entry).await?
        }
        Input::Remove(index) => handle.delete_file(index).await?,
        Input::Show => print_document(&handle.snapshot()),
        Input::Quit => {}
    }
    Ok(())
}

fn append_line(text: &str, line: &str) -> String {
    let mut out = text.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(line);
    out
}

async fn read_file_entry(path: &Path) -> Result<FileEntry> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .with_context(|| format!("{} has no file name", path.display()))?;
    Ok(FileEntry {
        name,
        size: data.len() as u64,
        mime_type: guess_mime(path).to_string(),
        data: STANDARD.encode(&data),
    })
}

fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "md" => "text/plain",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

// ── Output ────────────────────────────────────────────────────────────────────

/// Print connection changes to stderr and every unseen remote update to stdout.
async fn print_remote_changes(handle: ClientHandle) {
    let mut rx = handle.subscribe();
    let mut last = Snapshot::default();

    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();

        if snapshot.transport != last.transport {
            eprintln!("[{}]", snapshot.transport);
        }
        if snapshot.keyed && !last.keyed {
            eprintln!("[paired] compare keys with `scratchpad fingerprint`");
        }
        let changed = snapshot.text != last.text || snapshot.files != last.files;
        if snapshot.origin == Origin::Remote && !snapshot.notified && changed {
            print_document(&snapshot);
            if let Err(e) = handle.mark_notified().await {
                debug!(error = %e, "could not mark update as seen");
            }
        }
        last = snapshot;
    }
}

fn print_document(snapshot: &Snapshot) {
    let from = match snapshot.origin {
        Origin::Local => "local",
        Origin::Remote => "remote",
    };
    println!("--- {from} @ {} ---", snapshot.last_change);
    println!("{}", snapshot.text);
    for (index, file) in snapshot.files.iter().enumerate() {
        println!("[{index}] {} ({}, {})", file.name, file.mime_type, fmt_bytes(file.size));
    }
}

/// Give the flush tick a chance to push pending edits before shutdown.
async fn flush_before_exit(handle: &ClientHandle, config: &ScratchpadConfig) {
    let mut rx = handle.subscribe();
    let limit = Duration::from_millis(config.session.quiet_interval_ms)
        + config.session.flush_tick() * 2;
    let settled = matches!(
        tokio::time::timeout(
            limit,
            rx.wait_for(|s| {
                !(s.dirty || s.files_dirty) || !s.keyed || s.transport != TransportState::Open
            })
        )
        .await,
        Ok(Ok(_))
    );
    let snapshot = handle.snapshot();
    if !settled || snapshot.dirty || snapshot.files_dirty {
        warn!(
            dirty = snapshot.dirty,
            files_dirty = snapshot.files_dirty,
            "exiting with unsent changes"
        );
    }
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_lines_replace_text() {
        assert_eq!(parse_line("hello").unwrap(), Input::Replace("hello".into()));
        assert_eq!(parse_line("").unwrap(), Input::Replace(String::new()));
    }

    #[test]
    fn test_colon_commands() {
        assert_eq!(parse_line(":append more").unwrap(), Input::Append("more".into()));
        assert_eq!(
            parse_line(":file /tmp/a b.txt").unwrap(),
            Input::File(PathBuf::from("/tmp/a b.txt"))
        );
        assert_eq!(parse_line(":rm 2").unwrap(), Input::Remove(2));
        assert_eq!(parse_line(":show").unwrap(), Input::Show);
        assert_eq!(parse_line(":quit").unwrap(), Input::Quit);
        assert_eq!(parse_line(":q").unwrap(), Input::Quit);
    }

    #[test]
    fn test_bad_commands_are_errors() {
        assert!(parse_line(":rm two").is_err());
        assert!(parse_line(":file").is_err());
        assert!(parse_line(":nope").is_err());
    }

    #[test]
    fn test_append_starts_a_new_line() {
        assert_eq!(append_line("", "a"), "a");
        assert_eq!(append_line("a", "b"), "a\nb");
        assert_eq!(append_line("a\n", "b"), "a\nb");
    }

    #[tokio::test]
    async fn test_file_entry_is_base64() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.TXT");
        std::fs::write(&path, b"hi!").unwrap();

        let entry = read_file_entry(&path).await.unwrap();
        assert_eq!(entry.name, "notes.TXT");
        assert_eq!(entry.size, 3);
        assert_eq!(entry.mime_type, "text/plain");
        assert_eq!(entry.data, "aGkh");
    }

    #[test]
    fn test_byte_sizes() {
        assert_eq!(fmt_bytes(12), "12 B");
        assert_eq!(fmt_bytes(2048), "2.0 KB");
        assert_eq!(fmt_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
