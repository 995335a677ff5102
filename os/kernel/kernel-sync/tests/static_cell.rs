use kernel_sync::StaticCell;

#[test]
fn filled_once() {
    static CELL: StaticCell<u64> = StaticCell::new();

    assert!(CELL.get().is_none());
    assert_eq!(CELL.put(7), Ok(&7));
    assert_eq!(CELL.put(8), Err(8));
    assert_eq!(CELL.get(), Some(&7));
}
