use log::{debug, warn};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use crate::{paths, Storage, StorageError, StorageMode};

/// Descriptor file every save folder contains.
pub const SAVE_INFO_FILE: &str = "SaveGameInfo";

/// Staging directory inside the saves root; never a save.
pub const TEMP_DIRECTORY: &str = "cstemp";

/// Summary of one save, as shown to the user and stored next to cloud copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveInfo {
    pub folder_name: String,
    pub farmer_name: String,
    pub farm_name: String,
    pub days_played: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveListing {
    pub saves: Vec<SaveInfo>,
    /// At least one save could not be read and is missing from `saves`.
    pub load_failed: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error("Malformed save descriptor: {0}")]
    Malformed(String),
    #[error("Save descriptor does not match the expected schema: {0}")]
    Schema(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The incoming copy is older than the one it would replace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub folder_name: String,
    pub days_played: u32,
    pub existing_days_played: u32,
}

#[derive(Debug, Deserialize)]
struct FarmerDocument {
    name: String,
    #[serde(rename = "farmName")]
    farm_name: String,
    stats: Stats,
}

#[derive(Debug, Deserialize)]
struct Stats {
    #[serde(rename = "Values")]
    values: StatValues,
}

#[derive(Debug, Deserialize)]
struct StatValues {
    #[serde(rename = "item", default)]
    items: Vec<StatItem>,
}

#[derive(Debug, Deserialize)]
struct StatItem {
    key: StatKey,
    value: StatValue,
}

#[derive(Debug, Deserialize)]
struct StatKey {
    string: String,
}

#[derive(Debug, Deserialize)]
struct StatValue {
    #[serde(rename = "unsignedInt", default)]
    unsigned_int: Option<u32>,
}

fn root_element(xml: &str) -> Result<String, SaveError> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) | Ok(Event::Empty(element)) => {
                return Ok(String::from_utf8_lossy(element.local_name().as_ref()).into_owned());
            }
            Ok(Event::Eof) => return Err(SaveError::Malformed("document has no root element".into())),
            Ok(_) => {}
            Err(e) => return Err(SaveError::Malformed(e.to_string())),
        }
    }
}

/// Parses the `SaveGameInfo` XML of the save stored in `folder_name`.
pub fn parse_save_game_info(folder_name: &str, xml: &str) -> Result<SaveInfo, SaveError> {
    let root = root_element(xml)?;
    if root != "Farmer" {
        return Err(SaveError::Schema(format!("expected a Farmer element, found {root}")));
    }

    let farmer: FarmerDocument =
        quick_xml::de::from_str(xml).map_err(|e| SaveError::Schema(e.to_string()))?;

    let days_played = farmer
        .stats
        .values
        .items
        .into_iter()
        .find(|item| item.key.string == "daysPlayed")
        .and_then(|item| item.value.unsigned_int)
        .unwrap_or(0);

    Ok(SaveInfo {
        folder_name: folder_name.to_string(),
        farmer_name: farmer.name,
        farm_name: farmer.farm_name,
        days_played,
    })
}

/// Parses the JSON form of a [`SaveInfo`] kept alongside cloud copies.
pub fn parse_save_info_json(text: &str) -> Result<SaveInfo, SaveError> {
    serde_json::from_str(text).map_err(|e| SaveError::Schema(e.to_string()))
}

pub async fn read_save_info(
    storage: &Storage,
    mode: StorageMode,
    saves_path: &str,
    save_name: &str,
) -> Result<SaveInfo, SaveError> {
    let path = paths::combine(saves_path, &[save_name, SAVE_INFO_FILE]);
    let xml = storage.file_text(&path, mode).await?;
    parse_save_game_info(save_name, &xml)
}

/// Lists the saves under `saves_path`. A missing directory is an empty
/// listing; a save that cannot be read is logged and flagged through
/// [`SaveListing::load_failed`].
pub async fn get_local_saves(
    storage: &Storage,
    mode: StorageMode,
    saves_path: &str,
) -> Result<SaveListing, StorageError> {
    let names = match storage.subdirectory_names(saves_path, mode).await {
        Ok(names) => names,
        Err(StorageError::DirectoryDoesntExist(_)) => {
            debug!("Saves directory {saves_path} does not exist");
            return Ok(SaveListing::default());
        }
        Err(e) => return Err(e),
    };

    let mut listing = SaveListing::default();
    for name in names {
        if paths::equals_ignore_case(&name, TEMP_DIRECTORY) {
            continue;
        }
        match read_save_info(storage, mode, saves_path, &name).await {
            Ok(info) => listing.saves.push(info),
            Err(e) => {
                warn!("Failed to load save {name}: {e}");
                listing.load_failed = true;
            }
        }
    }
    Ok(listing)
}

/// Files at the top of a save folder that are never synced: the game's own
/// rolling backups.
pub fn is_excluded_name(file_name: &str, save_name: &str) -> bool {
    [
        "BACKUP_SAVE".to_string(),
        "SaveGameInfo_old".to_string(),
        format!("{save_name}_old"),
        format!("{save_name}_SVBAK"),
    ]
    .iter()
    .any(|excluded| paths::equals_ignore_case(file_name, excluded))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveFile {
    /// Absolute local path.
    pub path: String,
    /// Path below the save folder, `/`-separated.
    pub relative: String,
}

/// Everything inside a save folder that gets synced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveTree {
    /// Relative directory paths, parents before children.
    pub directories: Vec<String>,
    pub files: Vec<SaveFile>,
}

/// Walks `folder` recursively. Excluded names are only filtered at the top
/// level, where the game keeps its own backups.
pub async fn collect_save_tree(
    storage: &Storage,
    mode: StorageMode,
    folder: &str,
    save_name: &str,
) -> Result<SaveTree, StorageError> {
    let mut tree = SaveTree::default();
    let mut pending = vec![(paths::normalize(folder), String::new())];

    while let Some((directory, relative)) = pending.pop() {
        let root = relative.is_empty();
        for file in storage.file_paths(&directory, mode).await? {
            let name = paths::name(&file);
            if root && is_excluded_name(&name, save_name) {
                debug!("Skipping {file}");
                continue;
            }
            tree.files.push(SaveFile {
                path: file,
                relative: paths::combine(&relative, &[name.as_str()]),
            });
        }

        for subdirectory in storage.subdirectory_paths(&directory, mode).await? {
            let child = paths::combine(&relative, &[paths::name(&subdirectory).as_str()]);
            tree.directories.push(child.clone());
            pending.push((subdirectory, child));
        }
    }
    Ok(tree)
}

/// Case-insensitive search over farm and farmer names.
pub fn filter_saves<'a>(saves: &'a [SaveInfo], query: &str) -> Vec<&'a SaveInfo> {
    let query = query.trim().to_lowercase();
    saves
        .iter()
        .filter(|save| {
            query.is_empty()
                || save.farm_name.to_lowercase().contains(&query)
                || save.farmer_name.to_lowercase().contains(&query)
        })
        .collect()
}

/// Reports a conflict when `incoming` would replace a copy with more days
/// played.
pub fn find_conflict(incoming: &SaveInfo, existing: &[SaveInfo]) -> Option<Conflict> {
    existing
        .iter()
        .find(|save| save.folder_name == incoming.folder_name)
        .filter(|save| save.days_played > incoming.days_played)
        .map(|save| Conflict {
            folder_name: incoming.folder_name.clone(),
            days_played: incoming.days_played,
            existing_days_played: save.days_played,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DirectBackend;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn save_game_info(name: &str, farm: &str, days: Option<u32>) -> String {
        let days = days
            .map(|days| {
                format!(
                    "<item><key><string>daysPlayed</string></key><value><unsignedInt>{days}</unsignedInt></value></item>"
                )
            })
            .unwrap_or_default();
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<Farmer xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:xsd="http://www.w3.org/2001/XMLSchema">
  <name>{name}</name>
  <isEmoting>false</isEmoting>
  <farmName>{farm}</farmName>
  <stats>
    <Values>
      <item><key><string>stepsTaken</string></key><value><unsignedInt>12345</unsignedInt></value></item>
      {days}
    </Values>
  </stats>
  <money>500</money>
</Farmer>"#
        )
    }

    fn fixture() -> (TempDir, Storage, String) {
        let dir = TempDir::new().unwrap();
        let saves = paths::combine(&dir.path().to_string_lossy(), &["Saves"]);
        let storage = Storage::new("/nonexistent/Android/data", Arc::new(DirectBackend::unrestricted()));
        (dir, storage, saves)
    }

    async fn write(storage: &Storage, parent: &str, name: &str, content: &str) {
        storage
            .write_file(parent, name, content.as_bytes(), StorageMode::Legacy)
            .await
            .unwrap();
    }

    #[test]
    fn test_parse_save_game_info() {
        let info = parse_save_game_info("Farm_123", &save_game_info("Alex", "Sunny", Some(57))).unwrap();
        assert_eq!(
            info,
            SaveInfo {
                folder_name: "Farm_123".into(),
                farmer_name: "Alex".into(),
                farm_name: "Sunny".into(),
                days_played: 57,
            }
        );
    }

    #[test]
    fn test_numeric_names_and_missing_days() {
        let info = parse_save_game_info("Farm_1", &save_game_info("123", "456", None)).unwrap();
        assert_eq!(info.farmer_name, "123");
        assert_eq!(info.farm_name, "456");
        assert_eq!(info.days_played, 0);
    }

    #[test]
    fn test_schema_failures_are_typed() {
        let err = parse_save_game_info("Farm_1", "<Chest><name>x</name></Chest>").unwrap_err();
        assert!(matches!(err, SaveError::Schema(_)));

        let err = parse_save_game_info("Farm_1", "<Farmer><farmName>x</farmName></Farmer>").unwrap_err();
        assert!(matches!(err, SaveError::Schema(_)));

        let err = parse_save_game_info("Farm_1", "").unwrap_err();
        assert!(matches!(err, SaveError::Malformed(_)));
    }

    #[test]
    fn test_stats_are_required() {
        let no_stats = "<Farmer><name>Alex</name><farmName>Sunny</farmName></Farmer>";
        let err = parse_save_game_info("Farm_1", no_stats).unwrap_err();
        assert!(matches!(err, SaveError::Schema(_)));

        let no_values = "<Farmer><name>Alex</name><farmName>Sunny</farmName><stats></stats></Farmer>";
        let err = parse_save_game_info("Farm_1", no_values).unwrap_err();
        assert!(matches!(err, SaveError::Schema(_)));
    }

    #[tokio::test]
    async fn test_scan_skips_broken_saves_and_staging() {
        let (_dir, storage, saves) = fixture();
        for (folder, days) in [("Farm_1", 10), ("Farm_2", 20), ("Farm_3", 30)] {
            let xml = save_game_info("Alex", folder, Some(days));
            write(&storage, &paths::combine(&saves, &[folder]), SAVE_INFO_FILE, &xml).await;
        }
        write(&storage, &paths::combine(&saves, &["Broken_4"]), SAVE_INFO_FILE, "<Farmer><name>").await;
        let no_stats = "<Farmer><name>Alex</name><farmName>Bare</farmName></Farmer>";
        write(&storage, &paths::combine(&saves, &["Bare_5"]), SAVE_INFO_FILE, no_stats).await;
        write(&storage, &paths::combine(&saves, &["CSTEMP", "Farm_9"]), SAVE_INFO_FILE, "junk").await;

        let listing = get_local_saves(&storage, StorageMode::Legacy, &saves).await.unwrap();
        let mut names: Vec<_> = listing.saves.iter().map(|s| s.folder_name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["Farm_1", "Farm_2", "Farm_3"]);
        assert!(listing.load_failed);
    }

    #[tokio::test]
    async fn test_scan_of_missing_or_empty_root() {
        let (_dir, storage, saves) = fixture();

        let listing = get_local_saves(&storage, StorageMode::Legacy, &saves).await.unwrap();
        assert_eq!(listing, SaveListing::default());

        storage.create_directory(&saves, StorageMode::Legacy).await.unwrap();
        let listing = get_local_saves(&storage, StorageMode::Legacy, &saves).await.unwrap();
        assert!(listing.saves.is_empty());
        assert!(!listing.load_failed);
    }

    #[test]
    fn test_is_excluded_name() {
        assert!(is_excluded_name("Farm_1_old", "Farm_1"));
        assert!(is_excluded_name("farm_1_svbak", "Farm_1"));
        assert!(is_excluded_name("saveGameInfo_OLD", "Farm_1"));
        assert!(is_excluded_name("BACKUP_SAVE", "Farm_1"));
        assert!(!is_excluded_name("Farm_1", "Farm_1"));
        assert!(!is_excluded_name("SaveGameInfo", "Farm_1"));
        assert!(!is_excluded_name("Farm_2_old", "Farm_1"));
    }

    #[tokio::test]
    async fn test_collect_save_tree_excludes_only_at_root() {
        let (_dir, storage, saves) = fixture();
        let folder = paths::combine(&saves, &["Farm_1"]);
        write(&storage, &folder, "Farm_1", "save").await;
        write(&storage, &folder, "Farm_1_old", "old").await;
        write(&storage, &folder, SAVE_INFO_FILE, "info").await;
        write(&storage, &paths::combine(&folder, &["extra", "deep"]), "Farm_1_old", "kept").await;

        let tree = collect_save_tree(&storage, StorageMode::Legacy, &folder, "Farm_1")
            .await
            .unwrap();

        let mut files: Vec<_> = tree.files.iter().map(|f| f.relative.as_str()).collect();
        files.sort();
        assert_eq!(files, vec!["Farm_1", "SaveGameInfo", "extra/deep/Farm_1_old"]);
        assert_eq!(tree.directories, vec!["extra".to_string(), "extra/deep".to_string()]);
    }

    #[test]
    fn test_filter_and_conflicts() {
        let saves = vec![
            SaveInfo { folder_name: "A_1".into(), farmer_name: "Alex".into(), farm_name: "Sunny".into(), days_played: 40 },
            SaveInfo { folder_name: "B_2".into(), farmer_name: "Sam".into(), farm_name: "Rainy".into(), days_played: 5 },
        ];
        assert_eq!(filter_saves(&saves, "sun").len(), 1);
        assert_eq!(filter_saves(&saves, "SAM")[0].folder_name, "B_2");
        assert_eq!(filter_saves(&saves, "  ").len(), 2);

        let incoming = SaveInfo { days_played: 30, ..saves[0].clone() };
        let conflict = find_conflict(&incoming, &saves).unwrap();
        assert_eq!(conflict.existing_days_played, 40);
        assert!(find_conflict(&saves[1], &saves).is_none());
    }
}
