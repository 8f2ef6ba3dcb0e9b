use ledgerdb_storage::Column;

#[test]
fn column_bits_are_unique() {
    let mut seen = 0u32;
    for column in Column::ALL {
        assert_eq!(seen & column.bit(), 0, "duplicate bit for {column:?}");
        seen |= column.bit();
    }
}

#[test]
fn column_indices_match_all_order() {
    for (position, column) in Column::ALL.iter().enumerate() {
        assert_eq!(column.index(), position);
    }
}

#[test]
fn column_names_are_unique() {
    for a in Column::ALL {
        for b in Column::ALL {
            if a != b {
                assert_ne!(a.as_str(), b.as_str());
            }
        }
    }
}
