use proptest::prelude::*;
use vma_rs::mm::{InsertMode, Node, RangeAllocator};

const PAGE: u64 = 4096;
const TOTAL: u64 = 256 * PAGE;

#[derive(Debug, Clone)]
enum Op {
    Insert { pages: u64, align_shift: u32, color: u64, high: bool },
    Reserve { page: u64, pages: u64, color: u64 },
    Remove { index: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1u64..16, 0u32..5, 0u64..3, any::<bool>())
            .prop_map(|(pages, align_shift, color, high)| Op::Insert { pages, align_shift, color, high }),
        2 => (0u64..256, 1u64..8, 0u64..3).prop_map(|(page, pages, color)| Op::Reserve { page, pages, color }),
        2 => any::<usize>().prop_map(|index| Op::Remove { index }),
    ]
}

fn check(mm: &RangeAllocator) -> Result<(), TestCaseError> {
    let nodes: Vec<Node> = mm.iter().collect();
    for pair in nodes.windows(2) {
        prop_assert!(pair[0].end() <= pair[1].start, "overlap: {:?}", pair);
        if mm.color_adjust() && pair[0].color != pair[1].color {
            prop_assert!(pair[0].end() < pair[1].start, "colours touch: {:?}", pair);
        }
    }
    for node in &nodes {
        prop_assert!(node.end() <= TOTAL);
        prop_assert!(mm.valid_space(node.start));
    }
    Ok(())
}

proptest! {
    #[test]
    fn nodes_never_overlap(ops in prop::collection::vec(op(), 1..64), color_adjust in any::<bool>()) {
        let mut mm = RangeAllocator::new(0, TOTAL, color_adjust);
        let mut live: Vec<u64> = Vec::new();

        for op in ops {
            match op {
                Op::Insert { pages, align_shift, color, high } => {
                    let align = PAGE << align_shift;
                    let mode = if high { InsertMode::High } else { InsertMode::Low };
                    let fits = mm.can_fit(pages * PAGE, align, color, 0, TOTAL, mode);
                    match mm.insert(pages * PAGE, align, color, 0, TOTAL, mode) {
                        Ok(node) => {
                            prop_assert!(fits);
                            prop_assert_eq!(node.start % align, 0);
                            prop_assert_eq!(node.size, pages * PAGE);
                            live.push(node.start);
                        }
                        Err(_) => prop_assert!(!fits),
                    }
                }
                Op::Reserve { page, pages, color } => {
                    if let Ok(node) = mm.reserve(page * PAGE, pages * PAGE, color) {
                        prop_assert_eq!(node.start, page * PAGE);
                        live.push(node.start);
                    }
                }
                Op::Remove { index } => {
                    if !live.is_empty() {
                        let start = live.swap_remove(index % live.len());
                        prop_assert!(mm.remove(start).is_some());
                    }
                }
            }
            check(&mm)?;
            prop_assert_eq!(mm.len(), live.len());
        }
    }

    #[test]
    fn bounded_inserts_stay_in_range(
        pages in 1u64..8,
        lo in 0u64..128,
        span in 8u64..128,
        high in any::<bool>(),
    ) {
        let mut mm = RangeAllocator::new(0, TOTAL, false);
        let (start, end) = (lo * PAGE, (lo + span).min(256) * PAGE);
        let mode = if high { InsertMode::High } else { InsertMode::Low };
        let node = mm.insert(pages * PAGE, PAGE, 0, start, end, mode).unwrap();
        prop_assert!(node.start >= start && node.end() <= end);
        if high {
            prop_assert_eq!(node.end(), end);
        } else {
            prop_assert_eq!(node.start, start);
        }
    }

    #[test]
    fn freed_space_is_reusable(sizes in prop::collection::vec(1u64..16, 1..16)) {
        let mut mm = RangeAllocator::new(0, TOTAL, false);
        let nodes: Vec<Node> = sizes
            .iter()
            .map_while(|&p| mm.insert(p * PAGE, PAGE, 0, 0, TOTAL, InsertMode::Low).ok())
            .collect();
        for node in &nodes {
            mm.remove(node.start);
        }
        prop_assert!(mm.is_empty());
        prop_assert!(mm.insert(TOTAL, PAGE, 0, 0, TOTAL, InsertMode::Low).is_ok());
    }
}
