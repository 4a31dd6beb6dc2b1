use rasterbridge::{round_geometry, transform_geometry, transform_points, Crs, Error, Geometry};

#[test]
fn test_origin_point_same_crs() {
    let crs: Crs = "EPSG:3857".parse().unwrap();
    let point = Geometry::Point { coordinates: vec![0.0, 0.0] };
    let out = transform_geometry(&crs, &crs, &point, false, 10.0, 2).unwrap();
    assert_eq!(out, Geometry::Point { coordinates: vec![0.0, 0.0] });
}

#[test]
fn test_geojson_line_is_cut_and_rounded() {
    let crs = Crs::from_epsg(4326).unwrap();
    let line = Geometry::from_json(
        r#"{"type": "LineString", "coordinates": [[175.123456, 0.0], [-175.0, 10.0]]}"#,
    )
    .unwrap();

    let out = transform_geometry(&crs, &crs, &line, true, 10.0, 3).unwrap();
    match out {
        Geometry::MultiLineString { coordinates } => {
            assert_eq!(coordinates.len(), 2);
            assert_eq!(coordinates[0][0], vec![175.123, 0.0]);
            assert_eq!(coordinates[0].last().unwrap()[0], 180.0);
            assert_eq!(coordinates[1][0][0], -180.0);
            assert_eq!(coordinates[1].last().unwrap(), &vec![-175.0, 10.0]);
        }
        other => panic!("expected a MultiLineString, got {}", other.type_name()),
    }

    let uncut = transform_geometry(&crs, &crs, &line, false, 10.0, -1).unwrap();
    assert_eq!(uncut, line);
}

#[test]
fn test_unresolvable_crs() {
    let result = "not a crs".parse::<Crs>();
    assert!(matches!(result, Err(Error::Crs(_))));
}

#[test]
fn test_collection_rounding_limitation() {
    let collection = Geometry::GeometryCollection {
        geometries: vec![Geometry::Point { coordinates: vec![1.234, 5.678] }],
    };
    assert!(matches!(round_geometry(&collection, 1), Err(Error::Unsupported(_))));
}

#[test]
fn test_points_same_crs() {
    let crs = Crs::from_epsg(32631).unwrap();
    let (xs, ys, zs) = transform_points(&crs, &crs, &[1.0, 2.0], &[3.0, 4.0], Some(&[5.0, 6.0])).unwrap();
    assert_eq!(xs, vec![1.0, 2.0]);
    assert_eq!(ys, vec![3.0, 4.0]);
    assert_eq!(zs, Some(vec![5.0, 6.0]));
}

#[test]
fn test_unknown_authority_codes_are_rejected() {
    for input in ["EPSG:999999", "FOO:BAR", "epsg:0"] {
        assert!(matches!(input.parse::<Crs>(), Err(Error::Crs(_))), "{}", input);
    }
    assert!(matches!(Crs::from_epsg(999999), Err(Error::Crs(_))));
}

#[test]
fn test_line_to_web_mercator() {
    let wgs84 = Crs::from_epsg(4326).unwrap();
    let mercator = Crs::from_epsg(3857).unwrap();
    let line = Geometry::LineString {
        coordinates: vec![vec![0.0, 0.0], vec![10.0, 45.0]],
    };

    let out = transform_geometry(&wgs84, &mercator, &line, true, 10.0, 1).unwrap();
    assert_eq!(
        out,
        Geometry::LineString {
            coordinates: vec![vec![0.0, 0.0], vec![1113194.9, 5621521.5]],
        }
    );
}

#[test]
fn test_points_to_web_mercator_carry_z() {
    let wgs84 = Crs::from_epsg(4326).unwrap();
    let mercator = Crs::from_epsg(3857).unwrap();
    let (xs, ys, zs) = transform_points(&wgs84, &mercator, &[10.0, -10.0], &[0.0, 0.0], Some(&[5.0, 6.0])).unwrap();
    assert!((xs[0] - 1113194.908).abs() < 1e-3);
    assert!((xs[1] + 1113194.908).abs() < 1e-3);
    assert!(ys.iter().all(|y| y.abs() < 1e-6));
    assert_eq!(zs, Some(vec![5.0, 6.0]));
}
