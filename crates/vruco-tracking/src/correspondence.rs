use crate::marker_map::MarkerMap;
use crate::source::MarkerDetection;

/// Image/room point pairs for one frame.
///
/// `image[i]` and `room[i]` always belong to the same marker corner.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrespondenceSet {
    /// Pixel coordinates of the detected corners.
    pub image: Vec<[f64; 2]>,
    /// Room-space coordinates of the same corners.
    pub room: Vec<[f64; 3]>,
    /// Ids that contributed, in order.
    pub ids: Vec<u32>,
}

impl CorrespondenceSet {
    /// Pair every detection whose id is mapped with its room-space corners.
    ///
    /// Unmapped ids are skipped. A detection id repeated in the same frame is
    /// used once.
    pub fn build(detections: &[MarkerDetection], map: &MarkerMap) -> Self {
        let mut set = Self::default();
        for detection in detections {
            let Some(entry) = map.get(detection.id) else {
                continue;
            };
            if set.ids.contains(&detection.id) {
                continue;
            }
            set.ids.push(detection.id);
            set.image.extend_from_slice(&detection.corners);
            set.room.extend_from_slice(&entry.points);
        }
        set
    }

    /// Number of point pairs.
    pub fn len(&self) -> usize {
        self.image.len()
    }

    /// Whether no mapped marker was seen.
    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker_map::MarkerMapEntry;
    use crate::source::MarkerFamily;

    fn map() -> MarkerMap {
        let entries = (1..=3).map(|id| {
            let x = id as f64;
            MarkerMapEntry {
                id,
                points: [[x, 0.0, 0.0], [x, 1.0, 0.0], [x, 2.0, 0.0], [x, 3.0, 0.0]],
            }
        });
        MarkerMap::from_entries(MarkerFamily::ArucoMip36h12, 0.1, entries)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    fn detection(id: u32) -> MarkerDetection {
        let u = 100.0 * id as f64;
        MarkerDetection {
            id,
            corners: [[u, 0.0], [u, 1.0], [u, 2.0], [u, 3.0]],
        }
    }

    #[test]
    fn test_pairs_align_corner_by_corner() {
        let map = map();
        let detections = [detection(3), detection(1)];
        let set = CorrespondenceSet::build(&detections, &map);
        assert_eq!(set.len(), 8);
        assert_eq!(set.ids, vec![3, 1]);
        for (i, (uv, p)) in set.image.iter().zip(set.room.iter()).enumerate() {
            let id = set.ids[i / 4] as f64;
            assert_eq!(uv[0], 100.0 * id);
            assert_eq!(p[0], id);
            // corner k of the detection meets corner k of the entry
            assert_eq!(uv[1], p[1]);
        }
    }

    #[test]
    fn test_unmapped_ids_ignored() {
        let map = map();
        let detections = [detection(9), detection(2), detection(42)];
        let set = CorrespondenceSet::build(&detections, &map);
        assert_eq!(set.ids, vec![2]);
        assert_eq!(set.len(), 4);
        assert!(set.room.iter().all(|p| p[0] == 2.0));

        let only_unmapped = CorrespondenceSet::build(&[detection(9)], &map);
        assert!(only_unmapped.is_empty());
    }

    #[test]
    fn test_every_subset_gives_four_pairs_per_id() {
        let map = map();
        for mask in 0u32..8 {
            let detections: Vec<MarkerDetection> = (1..=3)
                .filter(|id| mask & (1 << (id - 1)) != 0)
                .map(detection)
                .collect();
            let set = CorrespondenceSet::build(&detections, &map);
            assert_eq!(set.len(), 4 * detections.len());
            assert_eq!(set.room.len(), set.image.len());
        }
    }
}
