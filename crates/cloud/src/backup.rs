use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, FixedOffset, Local};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Timestamp layout inside backup names, e.g. `2024-05-01T13.04.05+0200`.
/// Dots replace colons so the name is valid on every filesystem.
pub const BACKUP_DATE_FORMAT: &str = "%Y-%m-%dT%H.%M.%S%z";

const TIMESTAMP_PATTERN: &str = r"\d{4}-\d{2}-\d{2}T\d{2}\.\d{2}\.\d{2}[+-]\d{4}";

/// A timestamped copy of a save kept in the cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    /// Name of the backup folder in the cloud, `{folder_name}_[{timestamp}]`.
    pub cloud_folder_name: String,
    /// Name of the save the backup was made from.
    pub folder_name: String,
    pub date: DateTime<FixedOffset>,
}

fn backup_name_regex() -> Option<&'static Regex> {
    static REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    REGEX
        .get_or_init(|| Regex::new(&format!(r"^(.+)_\[({TIMESTAMP_PATTERN})\]$")).ok())
        .as_ref()
}

fn save_id_regex() -> Option<&'static Regex> {
    static REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    REGEX
        .get_or_init(|| Regex::new(&format!(r"^.+_\d+_\[{TIMESTAMP_PATTERN}\]$")).ok())
        .as_ref()
}

pub fn now() -> DateTime<FixedOffset> {
    Local::now().into()
}

pub fn format_backup_timestamp(date: &DateTime<FixedOffset>) -> String {
    date.format(BACKUP_DATE_FORMAT).to_string()
}

pub fn parse_backup_timestamp(text: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(text, BACKUP_DATE_FORMAT).ok()
}

pub fn backup_folder_name(save_name: &str, date: &DateTime<FixedOffset>) -> String {
    format!("{save_name}_[{}]", format_backup_timestamp(date))
}

/// Splits a backup folder name into the save name and the date it was taken.
pub fn parse_backup_name(cloud_folder_name: &str) -> Option<BackupInfo> {
    let captures = backup_name_regex()?.captures(cloud_folder_name)?;
    let folder_name = captures.get(1)?.as_str().to_string();
    let date = parse_backup_timestamp(captures.get(2)?.as_str())?;
    Some(BackupInfo {
        cloud_folder_name: cloud_folder_name.to_string(),
        folder_name,
        date,
    })
}

/// Whether the name has the `{farm}_{id}_[{timestamp}]` shape of a backup of
/// a game save folder.
pub fn is_save_backup_name(name: &str) -> bool {
    save_id_regex().is_some_and(|regex| regex.is_match(name))
}

/// The first two underscore-separated tokens of a backup name: the farm name
/// and the save id.
pub fn save_id_group(name: &str) -> String {
    name.splitn(3, '_').take(2).collect::<Vec<_>>().join("_")
}

/// Picks the entries to delete so that at most `keep` remain per group, the
/// newest ones. Entries without a date sort after every dated entry.
pub fn select_for_purge<T, K, G, D>(entries: Vec<T>, keep: usize, group: G, date: D) -> Vec<T>
where
    K: std::hash::Hash + Eq,
    G: Fn(&T) -> K,
    D: Fn(&T) -> Option<DateTime<FixedOffset>>,
{
    let mut groups: HashMap<K, Vec<T>> = HashMap::new();
    for entry in entries {
        groups.entry(group(&entry)).or_default().push(entry);
    }

    let mut doomed = Vec::new();
    for (_, mut members) in groups {
        members.sort_by(|a, b| date(b).cmp(&date(a)));
        if members.len() > keep {
            doomed.extend(members.drain(keep..));
        }
    }
    doomed
}
