//! Rotation of dated backup directories in daily, weekly and monthly tiers.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate, Weekday};
use derive_more::{Display, Error};

/// Configure how many entries every tier keeps.
///
/// A tier keeping `0` entries is disabled.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Defines how many days of daily backups to keep.
    pub daily: usize,

    /// Defines how many weekly backups to keep.
    ///
    /// A weekly backup is the first successful backup of an ISO week.
    pub weekly: usize,

    /// Defines how many monthly backups to keep.
    ///
    /// A monthly backup is the first successful backup of the month.
    pub monthly: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            daily: 5,
            weekly: 2,
            monthly: 1,
        }
    }
}

/// The rotation tiers.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash, serde::Serialize)]
pub enum TierKind {
    #[display("daily")]
    Daily,
    #[display("weekly")]
    Weekly,
    #[display("monthly")]
    Monthly,
}

impl TierKind {
    pub const ALL: [TierKind; 3] = [TierKind::Daily, TierKind::Weekly, TierKind::Monthly];

    /// Position of the tier in [TierKind::ALL].
    const fn index(self) -> usize {
        match self {
            TierKind::Daily => 0,
            TierKind::Weekly => 1,
            TierKind::Monthly => 2,
        }
    }

    /// Name of the entry directory of `database` for `date` inside the tier root.
    ///
    /// Daily entries are day directories shared by all databases.
    pub fn entry_name(self, database: &str, date: NaiveDate) -> String {
        match self {
            TierKind::Daily => date.format("%Y-%m-%d").to_string(),
            TierKind::Weekly => format!("{database}-{}", week_id(date)),
            TierKind::Monthly => format!("{database}-{}", month_id(date)),
        }
    }

    /// Date embedded into the entry directory `name`.
    ///
    /// Returns [None] for directories that aren't entries of `database`.
    fn entry_date(self, database: &str, name: &str) -> Option<NaiveDate> {
        match self {
            TierKind::Daily => NaiveDate::parse_from_str(name, "%Y-%m-%d").ok(),
            TierKind::Weekly => {
                let (year, week) = name.strip_prefix(database)?.strip_prefix('-')?.split_once("-W")?;
                NaiveDate::from_isoywd_opt(year.parse().ok()?, week.parse().ok()?, Weekday::Mon)
            }
            TierKind::Monthly => {
                let (year, month) = name.strip_prefix(database)?.strip_prefix('-')?.split_once('-')?;
                NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, 1)
            }
        }
    }
}

/// ISO week of `date`, e.g. `2024-W09`.
pub fn week_id(date: impl Datelike) -> String {
    let week = date.iso_week();
    format!("{:04}-W{:02}", week.year(), week.week())
}

/// Calendar month of `date`, e.g. `2024-03`.
pub fn month_id(date: impl Datelike) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

/// Lifecycle of a tier during a run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TierState {
    Idle,
    EntryAdded,
    Pruned,
}

/// A rotation tier with its own directory and limit.
#[derive(Clone, Debug)]
pub struct RetentionTier {
    pub kind: TierKind,
    pub root: PathBuf,
    pub max_entries: usize,
    state: TierState,
}

impl RetentionTier {
    pub fn new(kind: TierKind, root: PathBuf, max_entries: usize) -> Self {
        Self {
            kind,
            root,
            max_entries,
            state: TierState::Idle,
        }
    }

    pub fn state(&self) -> TierState {
        self.state
    }

    /// Whether the tier retains anything at all.
    pub fn is_enabled(&self) -> bool {
        self.max_entries > 0
    }
}

/// Creates the root directory of every tier.
///
/// Existing directories are left untouched.
pub fn ensure_tier_directories(tiers: &[RetentionTier]) -> io::Result<()> {
    for tier in tiers {
        fs::create_dir_all(&tier.root)?;
        log::trace!(target: "retention", "Tier directory ready: {}", tier.root.display());
    }
    Ok(())
}

/// A stale entry that couldn't be removed.
#[derive(Clone, Debug, Display, Error, serde::Serialize)]
#[display("Removing {} failed: {reason}", path.display())]
pub struct PruneFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of pruning a single tier.
#[derive(Clone, Debug, serde::Serialize)]
pub struct PruneReport {
    pub tier: TierKind,
    /// Entries left after pruning.
    pub kept: usize,
    /// Entries that were (or on a dry run would have been) removed.
    pub evicted: Vec<PathBuf>,
    pub failures: Vec<PruneFailure>,
}

/// Keeps the tiers of one database below their limits.
#[derive(Clone, Debug)]
pub struct RetentionManager {
    database: String,
    tiers: Vec<RetentionTier>,
}

impl RetentionManager {
    /// Lays out the tiers below `output_root`.
    pub fn new(output_root: &Path, database: impl Into<String>, config: &RetentionConfig) -> Self {
        let mut tiers: Vec<_> = TierKind::ALL
            .into_iter()
            .map(|kind| {
                let max_entries = match kind {
                    TierKind::Daily => config.daily,
                    TierKind::Weekly => config.weekly,
                    TierKind::Monthly => config.monthly,
                };
                RetentionTier::new(kind, output_root.join(kind.to_string()), max_entries)
            })
            .collect();
        tiers.sort_by_key(|tier| tier.kind.index());

        Self {
            database: database.into(),
            tiers,
        }
    }

    pub fn tiers(&self) -> &[RetentionTier] {
        &self.tiers
    }

    pub fn tier(&self, kind: TierKind) -> &RetentionTier {
        &self.tiers[kind.index()]
    }

    fn tier_mut(&mut self, kind: TierKind) -> &mut RetentionTier {
        &mut self.tiers[kind.index()]
    }

    /// Creates the root directories of all tiers.
    pub fn ensure_tier_directories(&self) -> io::Result<()> {
        ensure_tier_directories(&self.tiers)
    }

    /// Directory holding the backup of `date` in `kind`.
    ///
    /// Daily backups are grouped by day first:
    /// `daily/<YYYY-MM-DD>/<database>-<YYYY-MM-DD>`.
    pub fn entry_dir(&self, kind: TierKind, date: NaiveDate) -> PathBuf {
        let entry = self
            .tier(kind)
            .root
            .join(kind.entry_name(&self.database, date));
        match kind {
            TierKind::Daily => entry.join(format!("{}-{}", self.database, date.format("%Y-%m-%d"))),
            TierKind::Weekly | TierKind::Monthly => entry,
        }
    }

    /// Registers the backup at `path` for `date` in `kind`.
    ///
    /// Backups living outside the tier are copied into it. The copy only
    /// shows up under the entry name once it is complete, so a failed copy
    /// is retried by the next run of the period. Returns the entry
    /// directory, or [None] if the tier is disabled or already holds an entry
    /// for the period of `date`.
    pub fn record_entry(
        &mut self,
        kind: TierKind,
        date: NaiveDate,
        path: &Path,
    ) -> io::Result<Option<PathBuf>> {
        if !self.tier(kind).is_enabled() {
            log::debug!(target: "retention", "Tier {kind} is disabled, not recording {}", path.display());
            return Ok(None);
        }

        let entry = self.entry_dir(kind, date);
        if entry != path {
            if entry.exists() {
                log::debug!(target: "retention", "Tier {kind} already holds {}", entry.display());
                return Ok(None);
            }
            copy_entry(path, &entry)?;
        }

        log::info!(target: "retention", "Recorded {kind} backup: {}", entry.display());
        self.tier_mut(kind).state = TierState::EntryAdded;

        Ok(Some(entry))
    }

    /// Lists the entries of `kind` oldest first.
    fn entries(&self, kind: TierKind) -> io::Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.tier(kind).root)? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_dir() {
                continue;
            }
            let name = dir_entry.file_name();
            let Some(date) = name
                .to_str()
                .and_then(|name| kind.entry_date(&self.database, name))
            else {
                log::trace!(target: "retention", "Ignoring foreign directory: {}", dir_entry.path().display());
                continue;
            };
            entries.push((date, dir_entry.path()));
        }

        entries.sort();
        Ok(entries.into_iter().map(|(_, path)| path).collect())
    }

    /// Removes the oldest entries of `kind` exceeding its limit.
    ///
    /// Failures to remove single entries are collected in the report.
    /// On a dry run nothing is removed.
    pub fn prune(&mut self, kind: TierKind, dry_run: bool) -> PruneReport {
        let max_entries = self.tier(kind).max_entries;
        let mut report = PruneReport {
            tier: kind,
            kept: 0,
            evicted: Vec::new(),
            failures: Vec::new(),
        };

        let entries = match self.entries(kind) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                let failure = PruneFailure {
                    path: self.tier(kind).root.clone(),
                    reason: e.to_string(),
                };
                log::warn!(target: "retention", "{failure}");
                report.failures.push(failure);
                return report;
            }
        };

        let excess = entries.len().saturating_sub(max_entries);
        report.kept = entries.len() - excess;
        for entry in entries.into_iter().take(excess) {
            if dry_run {
                log::info!(target: "retention", "Would remove {kind} backup: {}", entry.display());
                report.evicted.push(entry);
                continue;
            }

            match fs::remove_dir_all(&entry) {
                Ok(()) => {
                    log::info!(target: "retention", "Removed {kind} backup: {}", entry.display());
                    report.evicted.push(entry);
                }
                Err(e) => {
                    let failure = PruneFailure {
                        path: entry,
                        reason: e.to_string(),
                    };
                    log::warn!(target: "retention", "{failure}");
                    report.kept += 1;
                    report.failures.push(failure);
                }
            }
        }

        self.tier_mut(kind).state = TierState::Pruned;
        report
    }

    /// Returns all tiers to [TierState::Idle] at the end of a run.
    pub fn settle(&mut self) {
        for tier in &mut self.tiers {
            tier.state = TierState::Idle;
        }
    }
}

/// Copies the entry `from` to `to` by way of a `.partial` sibling of `to`.
fn copy_entry(from: &Path, to: &Path) -> io::Result<()> {
    let mut partial = to.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);

    if fs::symlink_metadata(&partial).is_ok() {
        log::debug!(target: "retention", "Removing stale copy: {}", partial.display());
        fs::remove_dir_all(&partial)?;
    }

    if let Err(e) = copy_dir(from, &partial).and_then(|()| fs::rename(&partial, to)) {
        if let Err(cleanup) = fs::remove_dir_all(&partial) {
            if cleanup.kind() != io::ErrorKind::NotFound {
                log::warn!(target: "retention", "Failed to remove {}: {cleanup}", partial.display());
            }
        }
        return Err(e);
    }
    Ok(())
}

fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn names(paths: &[PathBuf]) -> Vec<String> {
        paths
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn manager(root: &Path, daily: usize, weekly: usize, monthly: usize) -> RetentionManager {
        let manager = RetentionManager::new(
            root,
            "shop",
            &RetentionConfig {
                daily,
                weekly,
                monthly,
            },
        );
        manager.ensure_tier_directories().unwrap();
        manager
    }

    #[test]
    fn period_ids() {
        assert_eq!(week_id(date("2024-03-07")), "2024-W10");
        // ISO week years differ from calendar years around new year
        assert_eq!(week_id(date("2024-12-30")), "2025-W01");
        assert_eq!(week_id(date("2021-01-03")), "2020-W53");
        assert_eq!(month_id(date("2024-03-07")), "2024-03");
    }

    #[test]
    fn entry_names_round_trip_to_period_start() {
        let day = date("2024-03-07");
        for (kind, start) in [
            (TierKind::Daily, day),
            (TierKind::Weekly, date("2024-03-04")),
            (TierKind::Monthly, date("2024-03-01")),
        ] {
            let name = kind.entry_name("shop", day);
            assert_eq!(kind.entry_date("shop", &name), Some(start), "{name}");
            assert_eq!(kind.entry_date("other", &name).is_some(), kind == TierKind::Daily);
        }
    }

    #[test]
    fn ensure_tier_directories_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path(), 5, 2, 1);
        manager.ensure_tier_directories().unwrap();

        assert_eq!(listing(root.path()), ["daily", "monthly", "weekly"]);
        for tier in manager.tiers() {
            assert!(tier.root.is_dir());
            assert_eq!(tier.state(), TierState::Idle);
        }
    }

    #[test]
    fn prune_keeps_most_recent_entries() {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), 2, 2, 1);
        for day in ["2024-01-03", "2024-01-01", "2024-01-02"] {
            let entry = manager.entry_dir(TierKind::Daily, date(day));
            fs::create_dir_all(&entry).unwrap();
            fs::write(entry.join("shop_DATA.sql"), "--").unwrap();
        }

        let report = manager.prune(TierKind::Daily, false);
        assert_eq!(names(&report.evicted), ["2024-01-01"]);
        assert_eq!(report.kept, 2);
        assert!(report.failures.is_empty());
        assert_eq!(
            listing(&manager.tier(TierKind::Daily).root),
            ["2024-01-02", "2024-01-03"]
        );
        assert_eq!(manager.tier(TierKind::Daily).state(), TierState::Pruned);

        manager.settle();
        assert_eq!(manager.tier(TierKind::Daily).state(), TierState::Idle);
    }

    #[test]
    fn prune_orders_by_embedded_date() {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), 5, 2, 1);
        let weekly = manager.tier(TierKind::Weekly).root.clone();
        // created newest first, so creation time disagrees with the names
        for name in ["shop-2025-W01", "shop-2024-W52", "shop-2024-W09", "other-2020-W01", "notes"] {
            fs::create_dir(weekly.join(name)).unwrap();
        }

        let report = manager.prune(TierKind::Weekly, false);
        assert_eq!(names(&report.evicted), ["shop-2024-W09"]);
        assert_eq!(
            listing(&weekly),
            ["notes", "other-2020-W01", "shop-2024-W52", "shop-2025-W01"]
        );
    }

    #[test]
    fn prune_below_limit_removes_nothing() {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), 5, 2, 1);
        fs::create_dir_all(manager.entry_dir(TierKind::Daily, date("2024-01-01"))).unwrap();

        let report = manager.prune(TierKind::Daily, false);
        assert!(report.evicted.is_empty());
        assert_eq!(report.kept, 1);
    }

    #[test]
    fn dry_run_prune_only_reports() {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), 1, 2, 1);
        for day in ["2024-01-01", "2024-01-02"] {
            fs::create_dir_all(manager.entry_dir(TierKind::Daily, date(day))).unwrap();
        }

        let report = manager.prune(TierKind::Daily, true);
        assert_eq!(names(&report.evicted), ["2024-01-01"]);
        assert_eq!(
            listing(&manager.tier(TierKind::Daily).root),
            ["2024-01-01", "2024-01-02"]
        );
    }

    #[test]
    fn prune_of_missing_root_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let mut manager = RetentionManager::new(root.path(), "shop", &RetentionConfig::default());

        let report = manager.prune(TierKind::Monthly, true);
        assert!(report.failures.is_empty());
        assert!(report.evicted.is_empty());
        assert_eq!(report.kept, 0);
    }

    #[test]
    fn unreadable_root_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let mut manager = RetentionManager::new(root.path(), "shop", &RetentionConfig::default());
        fs::write(&manager.tier(TierKind::Monthly).root, "not a directory").unwrap();

        let report = manager.prune(TierKind::Monthly, false);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, root.path().join("monthly"));
        assert!(report.evicted.is_empty());
    }

    #[test]
    fn record_entry_promotes_first_backup_of_period() {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), 5, 2, 1);

        let monday = manager.entry_dir(TierKind::Daily, date("2024-03-04"));
        fs::create_dir_all(&monday).unwrap();
        fs::write(monday.join("shop_DATA_20240304.sql"), "monday").unwrap();

        let daily = manager
            .record_entry(TierKind::Daily, date("2024-03-04"), &monday)
            .unwrap();
        assert_eq!(daily.as_deref(), Some(monday.as_path()));

        let weekly = manager
            .record_entry(TierKind::Weekly, date("2024-03-04"), &monday)
            .unwrap()
            .unwrap();
        assert_eq!(weekly, root.path().join("weekly/shop-2024-W10"));
        assert_eq!(
            fs::read_to_string(weekly.join("shop_DATA_20240304.sql")).unwrap(),
            "monday"
        );
        assert_eq!(manager.tier(TierKind::Weekly).state(), TierState::EntryAdded);

        // a later run in the same week keeps the first backup
        let tuesday = manager.entry_dir(TierKind::Daily, date("2024-03-05"));
        fs::create_dir_all(&tuesday).unwrap();
        fs::write(tuesday.join("shop_DATA_20240305.sql"), "tuesday").unwrap();
        assert_eq!(
            manager
                .record_entry(TierKind::Weekly, date("2024-03-05"), &tuesday)
                .unwrap(),
            None
        );
        assert_eq!(listing(&weekly), ["shop_DATA_20240304.sql"]);
    }

    #[cfg(unix)]
    #[test]
    fn failed_promotion_is_retried_by_the_next_run() {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), 5, 2, 1);
        let weekly_root = manager.tier(TierKind::Weekly).root.clone();

        let daily = manager.entry_dir(TierKind::Daily, date("2024-03-04"));
        fs::create_dir_all(&daily).unwrap();
        fs::write(daily.join("a.sql"), "a").unwrap();
        std::os::unix::fs::symlink(daily.join("missing.sql"), daily.join("b.sql")).unwrap();

        assert!(manager
            .record_entry(TierKind::Weekly, date("2024-03-04"), &daily)
            .is_err());
        assert!(listing(&weekly_root).is_empty());
        assert_eq!(manager.tier(TierKind::Weekly).state(), TierState::Idle);

        fs::remove_file(daily.join("b.sql")).unwrap();
        fs::write(daily.join("b.sql"), "b").unwrap();
        let weekly = manager
            .record_entry(TierKind::Weekly, date("2024-03-05"), &daily)
            .unwrap()
            .unwrap();
        assert_eq!(listing(&weekly), ["a.sql", "b.sql"]);
        assert_eq!(fs::read_to_string(weekly.join("b.sql")).unwrap(), "b");
        assert_eq!(listing(&weekly_root), ["shop-2024-W10"]);
    }

    #[test]
    fn stale_partial_copy_is_replaced() {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), 5, 2, 1);
        let monthly_root = manager.tier(TierKind::Monthly).root.clone();
        let stale = monthly_root.join("shop-2024-03.partial");
        fs::create_dir(&stale).unwrap();
        fs::write(stale.join("leftover.sql"), "--").unwrap();

        // an interrupted copy is not an entry
        let report = manager.prune(TierKind::Monthly, true);
        assert_eq!(report.kept, 0);

        let daily = manager.entry_dir(TierKind::Daily, date("2024-03-07"));
        fs::create_dir_all(&daily).unwrap();
        fs::write(daily.join("shop_DATA_20240307.sql"), "--").unwrap();

        let monthly = manager
            .record_entry(TierKind::Monthly, date("2024-03-07"), &daily)
            .unwrap()
            .unwrap();
        assert_eq!(listing(&monthly), ["shop_DATA_20240307.sql"]);
        assert_eq!(listing(&monthly_root), ["shop-2024-03"]);
    }

    #[test]
    fn tiers_are_looked_up_by_kind() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path(), 5, 2, 1);
        for kind in TierKind::ALL {
            assert_eq!(manager.tier(kind).kind, kind);
            assert_eq!(manager.tier(kind).root, root.path().join(kind.to_string()));
        }
        assert_eq!(manager.tier(TierKind::Weekly).max_entries, 2);
        assert_eq!(manager.tier(TierKind::Monthly).max_entries, 1);
    }

    #[test]
    fn disabled_tier_records_nothing() {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), 5, 0, 1);
        let daily = manager.entry_dir(TierKind::Daily, date("2024-03-04"));
        fs::create_dir_all(&daily).unwrap();

        assert_eq!(
            manager
                .record_entry(TierKind::Weekly, date("2024-03-04"), &daily)
                .unwrap(),
            None
        );
        assert!(listing(&manager.tier(TierKind::Weekly).root).is_empty());
    }

    #[test]
    fn daily_entries_are_grouped_by_day() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path(), 5, 2, 1);
        assert_eq!(
            manager.entry_dir(TierKind::Daily, date("2024-03-07")),
            root.path().join("daily/2024-03-07/shop-2024-03-07")
        );
        assert_eq!(
            manager.entry_dir(TierKind::Monthly, date("2024-03-07")),
            root.path().join("monthly/shop-2024-03")
        );
    }
}
