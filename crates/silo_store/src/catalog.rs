//! Catalog reader/writer: logical operations on the two system tables that
//! record committed region placement.
//!
//! The root table holds rows for the system regions (root, meta); the meta
//! table holds one row per user region. Rows are keyed by
//! [`RegionInfo::sort_key`] so a table's regions scan in key-range order and
//! split daughters sort after their parent. Placement recorded here lags the
//! coord-store: it is updated only when a transition commits (`OPENED`) and
//! at split commit, so readers may see stale locations and must retry.

use std::path::Path;

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{Deserialize, Serialize};

use crate::region::{RegionInfo, ServerName};

/// One catalog row. `offline && split` marks a split parent awaiting
/// garbage collection; its daughters are recorded alongside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogRow {
    pub region: RegionInfo,
    pub server: Option<ServerName>,
    pub offline: bool,
    pub split: bool,
    pub daughters: Option<(RegionInfo, RegionInfo)>,
}

impl CatalogRow {
    fn new(region: RegionInfo) -> Self {
        Self {
            region,
            server: None,
            offline: false,
            split: false,
            daughters: None,
        }
    }
}

pub struct Catalog {
    keyspace: Keyspace,
    root: PartitionHandle,
    meta: PartitionHandle,
}

impl Catalog {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path.as_ref())
            .open()
            .context("open catalog keyspace")?;
        let root = keyspace
            .open_partition("catalog_root", PartitionCreateOptions::default())
            .context("open root catalog partition")?;
        let meta = keyspace
            .open_partition("catalog_meta", PartitionCreateOptions::default())
            .context("open meta catalog partition")?;
        Ok(Self {
            keyspace,
            root,
            meta,
        })
    }

    fn partition_for(&self, region: &RegionInfo) -> &PartitionHandle {
        if region.is_system() {
            &self.root
        } else {
            &self.meta
        }
    }

    fn write_row(&self, row: &CatalogRow) -> anyhow::Result<()> {
        let data = serde_json::to_vec(row).context("encode catalog row")?;
        self.partition_for(&row.region)
            .insert(row.region.sort_key(), data)
            .context("write catalog row")?;
        Ok(())
    }

    pub fn row(&self, region: &RegionInfo) -> anyhow::Result<Option<CatalogRow>> {
        let part = self.partition_for(region);
        match part.get(region.sort_key()).context("read catalog row")? {
            Some(data) => Ok(Some(
                serde_json::from_slice(&data).context("decode catalog row")?,
            )),
            None => Ok(None),
        }
    }

    /// Insert a fresh row with no recorded location (table create, or a
    /// daughter row outside the split commit path).
    pub fn insert_region(&self, region: &RegionInfo) -> anyhow::Result<()> {
        self.write_row(&CatalogRow::new(region.clone()))
    }

    pub fn delete_region(&self, region: &RegionInfo) -> anyhow::Result<()> {
        self.partition_for(region)
            .remove(region.sort_key())
            .context("delete catalog row")?;
        Ok(())
    }

    /// Record the committed location of a region, preserving split/daughter
    /// markers if the row already exists.
    pub fn update_region_location(
        &self,
        region: &RegionInfo,
        server: &ServerName,
    ) -> anyhow::Result<()> {
        let mut row = self.row(region)?.unwrap_or_else(|| CatalogRow::new(region.clone()));
        row.region = region.clone();
        row.server = Some(server.clone());
        self.write_row(&row)?;
        tracing::debug!(region = %region.region_name(), server = %server, "catalog location updated");
        Ok(())
    }

    /// Split commit: in one atomic batch, mark the parent row
    /// offline+split with its daughters recorded, and insert both daughter
    /// rows. This is the split transaction's point of no return.
    pub fn offline_parent(
        &self,
        parent: &RegionInfo,
        daughter_a: &RegionInfo,
        daughter_b: &RegionInfo,
    ) -> anyhow::Result<()> {
        let mut parent_row = self
            .row(parent)?
            .unwrap_or_else(|| CatalogRow::new(parent.clone()));
        parent_row.offline = true;
        parent_row.split = true;
        parent_row.daughters = Some((daughter_a.clone(), daughter_b.clone()));

        let mut batch = self.keyspace.batch();
        batch.insert(
            self.partition_for(parent),
            parent.sort_key(),
            serde_json::to_vec(&parent_row).context("encode parent row")?,
        );
        for daughter in [daughter_a, daughter_b] {
            batch.insert(
                self.partition_for(daughter),
                daughter.sort_key(),
                serde_json::to_vec(&CatalogRow::new(daughter.clone()))
                    .context("encode daughter row")?,
            );
        }
        batch.commit().context("commit split catalog edit")?;
        tracing::info!(
            parent = %parent.region_name(),
            daughter_a = %daughter_a.region_name(),
            daughter_b = %daughter_b.region_name(),
            "catalog split commit"
        );
        Ok(())
    }

    /// Live (non-offline) regions of one user table, in key-range order.
    pub fn regions_of_table(&self, table: &str) -> anyhow::Result<Vec<RegionInfo>> {
        let prefix = format!("{table},");
        let mut regions = Vec::new();
        for item in self.meta.prefix(prefix) {
            let (_, data) = item.context("scan meta catalog")?;
            let row: CatalogRow = serde_json::from_slice(&data).context("decode catalog row")?;
            if !row.offline {
                regions.push(row.region);
            }
        }
        Ok(regions)
    }

    /// Every user-region row, split parents included.
    pub fn all_user_rows(&self) -> anyhow::Result<Vec<CatalogRow>> {
        let mut rows = Vec::new();
        for item in self.meta.iter() {
            let (_, data) = item.context("scan meta catalog")?;
            rows.push(serde_json::from_slice(&data).context("decode catalog row")?);
        }
        Ok(rows)
    }

    /// Live user regions eligible for assignment.
    pub fn all_user_regions(&self) -> anyhow::Result<Vec<RegionInfo>> {
        Ok(self
            .all_user_rows()?
            .into_iter()
            .filter(|row| !row.offline)
            .map(|row| row.region)
            .collect())
    }
}
