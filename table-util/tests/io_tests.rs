use table_util::dmatrix_util::{Mat, MatWithNames};

fn toy_matrix() -> MatWithNames {
    let mat = Mat::from_row_slice(
        3,
        2,
        &[
            1.5, -2.25, //
            0.0, f32::NAN, //
            100.0, 0.125,
        ],
    );
    MatWithNames::new(
        vec!["gene_a".into(), "gene_b".into(), "gene_c".into()],
        vec!["sample_1".into(), "sample_2".into()],
        mat,
    )
    .unwrap()
}

fn assert_same(a: &MatWithNames, b: &MatWithNames) {
    assert_eq!(a.rows, b.rows);
    assert_eq!(a.cols, b.cols);
    for i in 0..a.nrows() {
        for j in 0..a.ncols() {
            let (x, y) = (a.mat[(i, j)], b.mat[(i, j)]);
            if x.is_nan() {
                assert!(y.is_nan(), "expected NA at ({}, {})", i, j);
            } else {
                assert!((x - y).abs() < 1e-6, "mismatch at ({}, {})", i, j);
            }
        }
    }
}

#[test]
fn tsv_round_trip_preserves_na() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("expr.tsv");
    let file = file.to_str().unwrap();

    let orig = toy_matrix();
    orig.to_tsv(file, "gene").unwrap();

    let back = MatWithNames::from_tsv(file).unwrap();
    assert_same(&orig, &back);
}

#[test]
fn gzipped_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("expr.tsv.gz");
    let file = file.to_str().unwrap();

    let orig = toy_matrix();
    orig.to_tsv(file, "gene").unwrap();

    let back = MatWithNames::from_tsv(file).unwrap();
    assert_same(&orig, &back);
}

#[test]
fn header_without_corner_label_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("no_corner.tsv");
    std::fs::write(
        &file,
        "s1\ts2\ts3\ngene_a\t1\t2\t3\ngene_b\t4\tNA\t6\n",
    )
    .unwrap();

    let mat = MatWithNames::from_tsv(file.to_str().unwrap()).unwrap();
    assert_eq!(mat.nrows(), 2);
    assert_eq!(mat.ncols(), 3);
    assert_eq!(mat.cols[0], Box::from("s1"));
    assert!(mat.mat[(1, 1)].is_nan());
}

#[test]
fn comma_delimited_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("expr.csv");
    std::fs::write(&file, "id,s1,s2\ng1,1.0,2.0\ng2,3.0,4.0\n").unwrap();

    let mat = MatWithNames::from_tsv(file.to_str().unwrap()).unwrap();
    assert_eq!(mat.nrows(), 2);
    assert_eq!(mat.ncols(), 2);
    assert!((mat.mat[(1, 1)] - 4.0).abs() < 1e-6);
}

#[test]
fn duplicate_column_labels_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("dup.tsv");
    std::fs::write(&file, "id\ts1\ts1\ng1\t1\t2\n").unwrap();

    assert!(MatWithNames::from_tsv(file.to_str().unwrap()).is_err());
}
