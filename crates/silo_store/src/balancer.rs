//! Load balancer: pure planning over (live servers, region placement).
//!
//! The balancer never mutates anything. It returns an ordered move list the
//! assignment manager may enact, one region at a time. Policy is mean-count:
//! with `r = regions / servers`, servers above `ceil(r)` shed regions to
//! servers at or below `floor(r)`, preferring moves that reduce the count
//! spread the most, then moves whose destination already holds a local copy
//! of the region's data, then the lexicographically smallest region name.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use rand::Rng;

use crate::region::{RegionInfo, ServerName};

/// One advisory move: close `region` on `source`, reopen on `destination`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionMove {
    pub region: String,
    pub source: ServerName,
    pub destination: ServerName,
}

/// Compute the move list that levels per-server region counts into
/// `[floor(mean), ceil(mean)]`. `locality` maps a region's encoded name to
/// the server whose disk already hosts a replica of its data, when known.
pub fn balance(
    server_regions: &BTreeMap<ServerName, BTreeSet<String>>,
    locality: &HashMap<String, ServerName>,
) -> Vec<RegionMove> {
    let servers = server_regions.len();
    if servers <= 1 {
        return Vec::new();
    }
    let total: usize = server_regions.values().map(|r| r.len()).sum();
    let floor = total / servers;
    let ceil = floor + usize::from(total % servers != 0);

    let mut placement: BTreeMap<ServerName, BTreeSet<String>> = server_regions.clone();
    let mut moves = Vec::new();

    // Each step moves one region from the fullest server to the emptiest,
    // which is the single move with the largest spread reduction. Bounded by
    // the region count; mean-count levelling always terminates well before.
    for _ in 0..total {
        let donor = placement
            .iter()
            .max_by(|(a_name, a), (b_name, b)| {
                a.len().cmp(&b.len()).then(b_name.cmp(a_name))
            })
            .map(|(name, _)| name.clone());
        let receiver = placement
            .iter()
            .min_by(|(a_name, a), (b_name, b)| {
                a.len().cmp(&b.len()).then(a_name.cmp(b_name))
            })
            .map(|(name, _)| name.clone());
        let (Some(donor), Some(receiver)) = (donor, receiver) else {
            break;
        };
        let donor_len = placement[&donor].len();
        if donor_len <= ceil && placement[&receiver].len() >= floor {
            break;
        }

        let candidates = &placement[&donor];
        let region = candidates
            .iter()
            .find(|r| locality.get(*r) == Some(&receiver))
            .or_else(|| candidates.iter().next())
            .cloned();
        let Some(region) = region else {
            break;
        };

        if let Some(set) = placement.get_mut(&donor) {
            set.remove(&region);
        }
        if let Some(set) = placement.get_mut(&receiver) {
            set.insert(region.clone());
        }
        moves.push(RegionMove {
            region,
            source: donor,
            destination: receiver,
        });
    }
    moves
}

/// Round-robin full plan for cluster start. Servers are taken in sorted
/// order so a fresh cluster's layout is reproducible.
pub fn bulk_assignment(
    regions: &[RegionInfo],
    servers: &[ServerName],
) -> BTreeMap<ServerName, Vec<RegionInfo>> {
    let mut ordered: Vec<&ServerName> = servers.iter().collect();
    ordered.sort();
    ordered.dedup();
    let mut plan: BTreeMap<ServerName, Vec<RegionInfo>> = BTreeMap::new();
    if ordered.is_empty() {
        return plan;
    }
    for (idx, region) in regions.iter().enumerate() {
        let server = ordered[idx % ordered.len()];
        plan.entry(server.clone()).or_default().push(region.clone());
    }
    plan
}

/// Two-server random choice: sample two distinct servers and take the one
/// with fewer regions. Used for the root/meta assignments at startup, where
/// a full plan is not worth computing.
pub fn random_assignment(
    loads: &BTreeMap<ServerName, usize>,
    rng: &mut impl Rng,
) -> Option<ServerName> {
    let names: Vec<&ServerName> = loads.keys().collect();
    match names.len() {
        0 => None,
        1 => Some(names[0].clone()),
        n => {
            let first = rng.gen_range(0..n);
            let mut second = rng.gen_range(0..n - 1);
            if second >= first {
                second += 1;
            }
            let (a, b) = (names[first], names[second]);
            if loads[b] < loads[a] {
                Some(b.clone())
            } else {
                Some(a.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn server(i: u32) -> ServerName {
        ServerName::new(format!("rs{i}"), 8120, 1)
    }

    fn placement(counts: &[(u32, &[&str])]) -> BTreeMap<ServerName, BTreeSet<String>> {
        counts
            .iter()
            .map(|(i, regions)| {
                (
                    server(*i),
                    regions.iter().map(|r| r.to_string()).collect(),
                )
            })
            .collect()
    }

    fn spread(placement: &BTreeMap<ServerName, BTreeSet<String>>, moves: &[RegionMove]) -> Vec<usize> {
        let mut counts: BTreeMap<ServerName, isize> = placement
            .iter()
            .map(|(s, r)| (s.clone(), r.len() as isize))
            .collect();
        for mv in moves {
            *counts.get_mut(&mv.source).unwrap() -= 1;
            *counts.get_mut(&mv.destination).unwrap() += 1;
        }
        counts.values().map(|c| *c as usize).collect()
    }

    #[test]
    fn single_server_yields_no_moves() {
        let p = placement(&[(1, &["a", "b", "c", "d"])]);
        assert!(balance(&p, &HashMap::new()).is_empty());
    }

    #[test]
    fn balanced_cluster_is_left_alone() {
        let p = placement(&[(1, &["a", "b", "c"]), (2, &["d", "e", "f"]), (3, &["g", "h", "i"])]);
        assert!(balance(&p, &HashMap::new()).is_empty());
        // A remainder within [floor, ceil] is also fine.
        let p = placement(&[(1, &["a", "b"]), (2, &["c", "d"]), (3, &["e"])]);
        assert!(balance(&p, &HashMap::new()).is_empty());
    }

    #[test]
    fn skewed_cluster_levels_to_mean() {
        let p = placement(&[
            (1, &["a", "b", "c", "d", "e", "f"]),
            (2, &["g", "h", "i"]),
            (3, &[]),
        ]);
        let moves = balance(&p, &HashMap::new());
        assert_eq!(spread(&p, &moves), vec![3, 3, 3]);
        // Every move drains the overfull server.
        assert!(moves.iter().all(|m| m.source == server(1)));
    }

    #[test]
    fn locality_hint_steers_the_choice() {
        let p = placement(&[(1, &["a", "b", "c"]), (2, &[])]);
        let mut locality = HashMap::new();
        locality.insert("c".to_string(), server(2));
        let moves = balance(&p, &locality);
        assert_eq!(moves[0].region, "c");
        assert_eq!(moves[0].destination, server(2));
    }

    #[test]
    fn without_hints_the_smallest_region_name_moves_first() {
        let p = placement(&[(1, &["z", "m", "a"]), (2, &[])]);
        let moves = balance(&p, &HashMap::new());
        assert_eq!(moves[0].region, "a");
    }

    #[test]
    fn bulk_assignment_round_robins_in_server_order() {
        let regions: Vec<RegionInfo> = (0..7)
            .map(|i| RegionInfo::new("t", vec![i as u8], vec![i as u8 + 1], 100 + i))
            .collect();
        let servers = vec![server(2), server(1), server(3)];
        let plan = bulk_assignment(&regions, &servers);
        let counts: Vec<usize> = plan.values().map(|v| v.len()).collect();
        assert_eq!(counts, vec![3, 2, 2]);
        assert!(bulk_assignment(&regions, &[]).is_empty());
    }

    #[test]
    fn two_choice_prefers_the_lighter_server() {
        let mut loads = BTreeMap::new();
        loads.insert(server(1), 10);
        loads.insert(server(2), 0);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..32 {
            // With two servers, both are always sampled; the light one wins.
            assert_eq!(random_assignment(&loads, &mut rng), Some(server(2)));
        }
        assert_eq!(random_assignment(&BTreeMap::new(), &mut rng), None);
    }
}
