//! Maildir++ quarantine for detected threats and for messages that could not
//! be processed at all.

use crate::domain_utils::DomainUtils;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const MAX_ALIAS_HOPS: usize = 8;

static DELIVERY_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum QuarantineError {
    #[error("'{address}' does not resolve to a local mailbox")]
    Unresolvable { address: String },
    #[error("alias chain for '{address}' is too long or loops")]
    AliasLoop { address: String },
    #[error("failed to read alias map {path}: {source}")]
    AliasMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write maildir {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> QuarantineError + '_ {
    move |source| QuarantineError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Maps a recipient address to the address of the mailbox that stores it.
pub trait AliasResolver {
    fn resolve(&self, address: &str) -> Result<String, QuarantineError>;
}

/// Alias table read from a map file of `alias: target` or `alias target`
/// lines. `#` starts a comment.
#[derive(Debug, Clone, Default)]
pub struct MapAliasResolver {
    aliases: HashMap<String, String>,
}

impl MapAliasResolver {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self, QuarantineError> {
        let content = fs::read_to_string(path).map_err(|source| QuarantineError::AliasMap {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut aliases = HashMap::new();
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (alias, target) = match line.split_once(':') {
                Some((alias, target)) => (alias.trim(), target.trim()),
                None => match line.split_once(char::is_whitespace) {
                    Some((alias, target)) => (alias.trim(), target.trim()),
                    None => continue,
                },
            };
            // Only the first of several comma separated targets is a mailbox.
            let target = target.split(',').next().unwrap_or("").trim();
            if !alias.is_empty() && !target.is_empty() {
                aliases.insert(alias.to_lowercase(), target.to_lowercase());
            }
        }
        Self { aliases }
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

impl AliasResolver for MapAliasResolver {
    fn resolve(&self, address: &str) -> Result<String, QuarantineError> {
        let mut current = address.trim().to_lowercase();
        for _ in 0..MAX_ALIAS_HOPS {
            match self.aliases.get(&current) {
                Some(next) if *next != current => current = next.clone(),
                _ => {
                    if DomainUtils::mailbox_user(&current).is_none()
                        || DomainUtils::extract_domain(&current).map_or(true, |d| d.is_empty())
                    {
                        return Err(QuarantineError::Unresolvable {
                            address: address.to_string(),
                        });
                    }
                    return Ok(current);
                }
            }
        }
        Err(QuarantineError::AliasLoop {
            address: address.to_string(),
        })
    }
}

/// Expand `{domain}`, `{user}` and `{address}` for a mailbox address.
pub fn maildir_path(template: &str, mailbox: &str) -> Result<PathBuf, QuarantineError> {
    let unresolvable = || QuarantineError::Unresolvable {
        address: mailbox.to_string(),
    };
    let user = DomainUtils::mailbox_user(mailbox).ok_or_else(unresolvable)?;
    let domain = DomainUtils::extract_domain(mailbox).ok_or_else(unresolvable)?;
    if ![user.as_str(), domain.as_str(), mailbox].into_iter().all(is_path_component) {
        return Err(unresolvable());
    }
    Ok(PathBuf::from(
        template
            .replace("{domain}", &domain)
            .replace("{user}", &user)
            .replace("{address}", mailbox),
    ))
}

/// A value that stays a single, non-hidden path component.
fn is_path_component(value: &str) -> bool {
    !value.is_empty() && !value.starts_with('.') && !value.contains(['/', '\\', '\0'])
}

/// Writes messages into a Maildir with the tmp-then-rename protocol.
#[derive(Debug, Clone)]
pub struct MaildirWriter {
    hostname: String,
}

impl MaildirWriter {
    pub fn new(hostname: &str) -> Self {
        let hostname = hostname.replace('/', "\\057").replace(':', "\\072");
        Self { hostname }
    }

    /// Store `message` in `root`, or in the Maildir++ sub-folder
    /// `.<folder>` of it. Returns the final path in `new/`.
    pub fn write(&self, root: &Path, folder: Option<&str>, message: &[u8]) -> Result<PathBuf, QuarantineError> {
        let dir = match folder {
            Some(folder) => root.join(format!(".{folder}")),
            None => root.to_path_buf(),
        };
        for sub in ["cur", "new", "tmp"] {
            let path = dir.join(sub);
            fs::create_dir_all(&path).map_err(io_error(&path))?;
        }
        if folder.is_some() {
            let marker = dir.join("maildirfolder");
            if !marker.exists() {
                fs::File::create(&marker).map_err(io_error(&marker))?;
            }
        }

        let name = self.unique_name();
        let tmp_path = dir.join("tmp").join(&name);
        let new_path = dir.join("new").join(&name);

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .map_err(io_error(&tmp_path))?;
        file.write_all(message).map_err(io_error(&tmp_path))?;
        file.sync_all().map_err(io_error(&tmp_path))?;
        drop(file);

        fs::rename(&tmp_path, &new_path).map_err(io_error(&new_path))?;
        log::debug!("{} bytes written to {}", message.len(), new_path.display());
        Ok(new_path)
    }

    /// `<seconds>.M<micros>P<pid>Q<n>.<host>`
    fn unique_name(&self) -> String {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let sequence = DELIVERY_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}.M{}P{}Q{}.{}",
            now.as_secs(),
            now.subsec_micros(),
            std::process::id(),
            sequence,
            self.hostname
        )
    }
}

/// Spam folder of the recipient's real mailbox.
pub struct SpamQuarantine<'a> {
    resolver: &'a dyn AliasResolver,
    path_template: &'a str,
    folder: &'a str,
    writer: MaildirWriter,
}

impl<'a> SpamQuarantine<'a> {
    pub fn new(resolver: &'a dyn AliasResolver, path_template: &'a str, folder: &'a str, hostname: &str) -> Self {
        Self {
            resolver,
            path_template,
            folder,
            writer: MaildirWriter::new(hostname),
        }
    }

    pub fn store(&self, recipient: &str, message: &[u8]) -> Result<PathBuf, QuarantineError> {
        let mailbox = self.resolver.resolve(recipient)?;
        let root = maildir_path(self.path_template, &mailbox)?;
        let path = self.writer.write(&root, Some(self.folder), message)?;
        log::info!("Quarantined message for {recipient} (mailbox {mailbox}) in {}", path.display());
        Ok(path)
    }
}
