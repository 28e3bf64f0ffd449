use std::collections::{HashMap, HashSet};

use crate::actor::ActorId;
use crate::geometry::{Aabb, Vec2};

/// Slack added around every tight box so small movements stay inside the
/// stored bounds and skip a grid update.
const FAT_MARGIN: f32 = 4.0;

const DEFAULT_CELL_SIZE: f32 = 128.0;

/// Handle to a broad-phase entry. Proxies do not outlive their owner; the
/// owner is responsible for removing the proxy before the id is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProxyId(u32);

#[derive(Debug)]
struct Proxy {
    owner: ActorId,
    fat: Aabb,
    cells: CellRange,
    moved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CellRange {
    x0: i32,
    y0: i32,
    x1: i32,
    y1: i32,
}

/// Uniform-grid broad phase over fattened bounds.
///
/// `update_pairs` reports each overlapping pair exactly once when it forms;
/// a pair is forgotten when the fattened bounds separate or either proxy is
/// removed, after which re-overlap reports it again.
#[derive(Debug)]
pub struct SpatialIndex {
    cell_size: f32,
    proxies: Vec<Option<Proxy>>,
    free: Vec<u32>,
    grid: HashMap<(i32, i32), Vec<u32>>,
    moved: Vec<u32>,
    active_pairs: HashSet<(u32, u32)>,
    live: usize,
}

impl Default for SpatialIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SpatialIndex {
    pub fn new() -> Self {
        Self::with_cell_size(DEFAULT_CELL_SIZE)
    }

    pub fn with_cell_size(cell_size: f32) -> Self {
        debug_assert!(cell_size > 0.0);
        Self {
            cell_size,
            proxies: Vec::new(),
            free: Vec::new(),
            grid: HashMap::new(),
            moved: Vec::new(),
            active_pairs: HashSet::new(),
            live: 0,
        }
    }

    pub fn proxy_count(&self) -> usize {
        self.live
    }

    pub fn owner(&self, id: ProxyId) -> Option<ActorId> {
        self.proxy(id).map(|p| p.owner)
    }

    pub fn fat_bounds(&self, id: ProxyId) -> Option<Aabb> {
        self.proxy(id).map(|p| p.fat)
    }

    pub fn insert(&mut self, owner: ActorId, aabb: Aabb) -> ProxyId {
        let fat = aabb.expanded(FAT_MARGIN);
        let cells = self.cell_range(&fat);
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.proxies.push(None);
                (self.proxies.len() - 1) as u32
            }
        };
        self.proxies[index as usize] = Some(Proxy {
            owner,
            fat,
            cells,
            moved: true,
        });
        self.link(index, cells);
        self.moved.push(index);
        self.live += 1;
        ProxyId(index)
    }

    pub fn remove(&mut self, id: ProxyId) {
        let Some(proxy) = self.proxies.get_mut(id.0 as usize).and_then(Option::take) else {
            debug_assert!(false, "removing unknown proxy {id:?}");
            return;
        };
        self.unlink(id.0, proxy.cells);
        // Slot indices get reused by the next insert, so pairs naming this
        // slot must die now or they would mask the new proxy's first overlap.
        self.active_pairs
            .retain(|&(a, b)| a != id.0 && b != id.0);
        self.free.push(id.0);
        self.live -= 1;
        // Stale moved entries are skipped lazily in update_pairs.
    }

    /// Re-roots the proxy when the tight box escapes its fattened bounds.
    /// The new bounds are stretched along `displacement` so the entry also
    /// covers where the owner is headed. Returns whether the grid changed.
    pub fn move_proxy(&mut self, id: ProxyId, aabb: Aabb, displacement: Vec2) -> bool {
        let cell_size = self.cell_size;
        let Some(proxy) = self.proxy_mut(id) else {
            debug_assert!(false, "moving unknown proxy {id:?}");
            return false;
        };
        if proxy.fat.contains(&aabb) {
            return false;
        }
        let fat = aabb.expanded(FAT_MARGIN).extended_by(displacement);
        let old_cells = proxy.cells;
        let new_cells = cell_range_for(&fat, cell_size);
        proxy.fat = fat;
        proxy.cells = new_cells;
        let newly_moved = !proxy.moved;
        proxy.moved = true;
        if old_cells != new_cells {
            self.unlink(id.0, old_cells);
            self.link(id.0, new_cells);
        }
        if newly_moved {
            self.moved.push(id.0);
        }
        true
    }

    /// Visits every proxy whose fattened bounds overlap `aabb`. The visitor
    /// returns `false` to abort; the return value is `false` if it did.
    pub fn query_box(&self, aabb: Aabb, mut visitor: impl FnMut(ProxyId, ActorId) -> bool) -> bool {
        let range = self.cell_range(&aabb);
        let mut seen = HashSet::new();
        for cx in range.x0..=range.x1 {
            for cy in range.y0..=range.y1 {
                let Some(bucket) = self.grid.get(&(cx, cy)) else {
                    continue;
                };
                for &index in bucket {
                    if !seen.insert(index) {
                        continue;
                    }
                    let Some(proxy) = self.proxies[index as usize].as_ref() else {
                        continue;
                    };
                    if proxy.fat.overlaps(&aabb) && !visitor(ProxyId(index), proxy.owner) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Visits every proxy whose fattened bounds intersect the circle.
    pub fn query_radius(
        &self,
        center: Vec2,
        radius: f32,
        mut visitor: impl FnMut(ProxyId, ActorId) -> bool,
    ) -> bool {
        let around = Aabb::new(
            center.x - radius,
            center.y - radius,
            center.x + radius,
            center.y + radius,
        );
        self.query_box(around, |id, owner| {
            let Some(proxy) = self.proxy(id) else {
                return true;
            };
            if proxy.fat.intersects_circle(center, radius) {
                visitor(id, owner)
            } else {
                true
            }
        })
    }

    /// Diffs the active pair set against the grid and reports newly formed
    /// overlaps, once per pair, through `report`.
    pub fn update_pairs(&mut self, mut report: impl FnMut(ActorId, ActorId)) {
        let proxies = &self.proxies;
        self.active_pairs.retain(|&(a, b)| {
            let (Some(pa), Some(pb)) = (
                proxies.get(a as usize).and_then(Option::as_ref),
                proxies.get(b as usize).and_then(Option::as_ref),
            ) else {
                return false;
            };
            pa.fat.overlaps(&pb.fat)
        });

        let moved = std::mem::take(&mut self.moved);
        let mut seen = HashSet::new();
        for &index in &moved {
            let Some(proxy) = self.proxies[index as usize].as_ref() else {
                continue;
            };
            let fat = proxy.fat;
            let owner = proxy.owner;
            let range = proxy.cells;
            seen.clear();
            for cx in range.x0..=range.x1 {
                for cy in range.y0..=range.y1 {
                    let Some(bucket) = self.grid.get(&(cx, cy)) else {
                        continue;
                    };
                    for &other in bucket {
                        if other == index || !seen.insert(other) {
                            continue;
                        }
                        let Some(other_proxy) = self.proxies[other as usize].as_ref() else {
                            continue;
                        };
                        if !fat.overlaps(&other_proxy.fat) {
                            continue;
                        }
                        let key = (index.min(other), index.max(other));
                        if self.active_pairs.insert(key) {
                            report(owner, other_proxy.owner);
                        }
                    }
                }
            }
        }
        for index in moved {
            if let Some(proxy) = self.proxies[index as usize].as_mut() {
                proxy.moved = false;
            }
        }
    }

    fn proxy(&self, id: ProxyId) -> Option<&Proxy> {
        self.proxies.get(id.0 as usize).and_then(Option::as_ref)
    }

    fn proxy_mut(&mut self, id: ProxyId) -> Option<&mut Proxy> {
        self.proxies.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    fn cell_range(&self, aabb: &Aabb) -> CellRange {
        cell_range_for(aabb, self.cell_size)
    }

    fn link(&mut self, index: u32, range: CellRange) {
        for cx in range.x0..=range.x1 {
            for cy in range.y0..=range.y1 {
                self.grid.entry((cx, cy)).or_default().push(index);
            }
        }
    }

    fn unlink(&mut self, index: u32, range: CellRange) {
        for cx in range.x0..=range.x1 {
            for cy in range.y0..=range.y1 {
                if let Some(bucket) = self.grid.get_mut(&(cx, cy)) {
                    if let Some(at) = bucket.iter().position(|&p| p == index) {
                        bucket.swap_remove(at);
                    }
                    if bucket.is_empty() {
                        self.grid.remove(&(cx, cy));
                    }
                }
            }
        }
    }
}

fn cell_range_for(aabb: &Aabb, cell_size: f32) -> CellRange {
    CellRange {
        x0: (aabb.l / cell_size).floor() as i32,
        y0: (aabb.t / cell_size).floor() as i32,
        x1: (aabb.r / cell_size).floor() as i32,
        y1: (aabb.b / cell_size).floor() as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Actor, ActorArena};

    fn ids(count: usize) -> Vec<ActorId> {
        let mut arena = ActorArena::new();
        (0..count).map(|_| arena.insert(Actor::default())).collect()
    }

    fn collect_pairs(index: &mut SpatialIndex) -> Vec<(ActorId, ActorId)> {
        let mut pairs = Vec::new();
        index.update_pairs(|a, b| pairs.push((a, b)));
        pairs
    }

    #[test]
    fn new_overlap_is_reported_exactly_once() {
        let owners = ids(2);
        let mut index = SpatialIndex::new();
        index.insert(owners[0], Aabb::new(0.0, 0.0, 16.0, 16.0));
        index.insert(owners[1], Aabb::new(8.0, 8.0, 24.0, 24.0));

        assert_eq!(collect_pairs(&mut index).len(), 1);
        // Nothing moved since; the standing pair must stay silent.
        assert!(collect_pairs(&mut index).is_empty());
    }

    #[test]
    fn separation_then_reoverlap_reports_again() {
        let owners = ids(2);
        let mut index = SpatialIndex::new();
        let a = index.insert(owners[0], Aabb::new(0.0, 0.0, 16.0, 16.0));
        index.insert(owners[1], Aabb::new(8.0, 0.0, 24.0, 16.0));
        assert_eq!(collect_pairs(&mut index).len(), 1);

        let far = Aabb::new(500.0, 0.0, 516.0, 16.0);
        assert!(index.move_proxy(a, far, Vec2::ZERO));
        assert!(collect_pairs(&mut index).is_empty());

        let back = Aabb::new(8.0, 0.0, 24.0, 16.0);
        assert!(index.move_proxy(a, back, Vec2::ZERO));
        assert_eq!(collect_pairs(&mut index).len(), 1);
    }

    #[test]
    fn small_moves_inside_fat_bounds_do_not_touch_the_grid() {
        let owners = ids(1);
        let mut index = SpatialIndex::new();
        let a = index.insert(owners[0], Aabb::new(0.0, 0.0, 16.0, 16.0));
        collect_pairs(&mut index);

        let nudged = Aabb::new(1.0, 1.0, 17.0, 17.0);
        assert!(!index.move_proxy(a, nudged, Vec2::ZERO));
    }

    #[test]
    fn removed_proxy_drops_its_pairs_and_count() {
        let owners = ids(2);
        let mut index = SpatialIndex::new();
        let a = index.insert(owners[0], Aabb::new(0.0, 0.0, 16.0, 16.0));
        let b = index.insert(owners[1], Aabb::new(8.0, 0.0, 24.0, 16.0));
        assert_eq!(collect_pairs(&mut index).len(), 1);
        assert_eq!(index.proxy_count(), 2);

        index.remove(a);
        assert_eq!(index.proxy_count(), 1);
        assert!(collect_pairs(&mut index).is_empty());

        // Moving the survivor back over the dead proxy's old spot reports
        // nothing against it.
        assert!(index.move_proxy(b, Aabb::new(0.0, 0.0, 16.0, 16.0), Vec2::ZERO));
        assert!(collect_pairs(&mut index).is_empty());
    }

    #[test]
    fn reused_slot_reports_overlap_with_the_new_occupant() {
        let owners = ids(3);
        let mut index = SpatialIndex::new();
        index.insert(owners[0], Aabb::new(0.0, 0.0, 16.0, 16.0));
        let b = index.insert(owners[1], Aabb::new(8.0, 0.0, 24.0, 16.0));
        assert_eq!(collect_pairs(&mut index).len(), 1);

        // Remove and immediately reoccupy the slot without an update_pairs
        // call in between, the way a rollback respawns checkpoint actors.
        index.remove(b);
        let c = index.insert(owners[2], Aabb::new(8.0, 0.0, 24.0, 16.0));
        assert_eq!(c, b);

        let pairs = collect_pairs(&mut index);
        assert_eq!(pairs.len(), 1);
        let (x, y) = pairs[0];
        assert!(x == owners[2] || y == owners[2]);
    }

    #[test]
    fn query_visits_cell_spanning_proxies_once() {
        let owners = ids(1);
        let mut index = SpatialIndex::with_cell_size(32.0);
        // Spans several grid cells.
        index.insert(owners[0], Aabb::new(0.0, 0.0, 100.0, 100.0));

        let mut visits = 0;
        index.query_box(Aabb::new(-10.0, -10.0, 110.0, 110.0), |_, _| {
            visits += 1;
            true
        });
        assert_eq!(visits, 1);
    }

    #[test]
    fn query_radius_filters_by_distance() {
        let owners = ids(2);
        let mut index = SpatialIndex::new();
        index.insert(owners[0], Aabb::new(0.0, 0.0, 16.0, 16.0));
        index.insert(owners[1], Aabb::new(200.0, 0.0, 216.0, 16.0));

        let mut hits = Vec::new();
        index.query_radius(Vec2::new(8.0, 8.0), 30.0, |_, owner| {
            hits.push(owner);
            true
        });
        assert_eq!(hits, vec![owners[0]]);
    }

    #[test]
    fn query_box_early_abort_stops_the_scan() {
        let owners = ids(3);
        let mut index = SpatialIndex::new();
        for owner in &owners {
            index.insert(*owner, Aabb::new(0.0, 0.0, 16.0, 16.0));
        }
        let mut visits = 0;
        let completed = index.query_box(Aabb::new(0.0, 0.0, 16.0, 16.0), |_, _| {
            visits += 1;
            false
        });
        assert!(!completed);
        assert_eq!(visits, 1);
    }

    #[test]
    fn displacement_extends_bounds_ahead_of_motion() {
        let owners = ids(1);
        let mut index = SpatialIndex::new();
        let a = index.insert(owners[0], Aabb::new(0.0, 0.0, 16.0, 16.0));
        index.move_proxy(a, Aabb::new(40.0, 0.0, 56.0, 16.0), Vec2::new(20.0, 0.0));
        let fat = index.fat_bounds(a).unwrap();
        assert!(fat.r >= 76.0);
        assert!(fat.l <= 36.0);
    }
}
