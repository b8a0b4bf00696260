use std::collections::{BTreeMap, BTreeSet};

use rusqlite::{Connection, Transaction};
use tracing::debug;

use layeredit_core::{
    Feature, FeatureId, FeatureRequest, FieldDef, FieldOrigin, FieldType, FieldValue, Geometry,
};

use crate::error::StorageError;
use crate::traits::{AttributeChanges, FeatureStore, GeometryChanges, rowid};

fn feature_id(rowid: i64) -> Result<FeatureId, StorageError> {
    u64::try_from(rowid)
        .map(FeatureId::Persisted)
        .map_err(|_| StorageError::Serialization(format!("negative rowid {}", rowid)))
}

fn encode_attributes(values: &[FieldValue]) -> Result<Vec<u8>, StorageError> {
    rmp_serde::to_vec(values).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode_attributes(bytes: &[u8]) -> Result<Vec<FieldValue>, StorageError> {
    rmp_serde::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn encode_geometry(geometry: Option<&Geometry>) -> Result<Option<Vec<u8>>, StorageError> {
    geometry
        .map(|g| rmp_serde::to_vec(g).map_err(|e| StorageError::Serialization(e.to_string())))
        .transpose()
}

fn decode_geometry(bytes: Option<Vec<u8>>) -> Result<Option<Geometry>, StorageError> {
    bytes
        .map(|b| rmp_serde::from_slice(&b).map_err(|e| StorageError::Serialization(e.to_string())))
        .transpose()
}

/// Bounding-box columns for a geometry, all NULL when absent.
fn bbox_params(geometry: Option<&Geometry>) -> [Option<f64>; 4] {
    match geometry.and_then(|g| g.bounding_box()) {
        Some(r) => [Some(r.xmin), Some(r.ymin), Some(r.xmax), Some(r.ymax)],
        None => [None; 4],
    }
}

fn field_count(tx: &Transaction) -> Result<usize, StorageError> {
    let count: i64 = tx.query_row("SELECT COUNT(*) FROM layer_fields", [], |row| row.get(0))?;
    Ok(count as usize)
}

fn read_field_rows(conn: &Connection) -> Result<Vec<(String, String)>, StorageError> {
    let mut stmt = conn.prepare("SELECT name, field_type FROM layer_fields ORDER BY position")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn write_field_rows(tx: &Transaction, rows: &[(String, String)]) -> Result<(), StorageError> {
    tx.execute("DELETE FROM layer_fields", [])?;
    for (position, (name, field_type)) in rows.iter().enumerate() {
        tx.execute(
            "INSERT INTO layer_fields (position, name, field_type) VALUES (?1, ?2, ?3)",
            rusqlite::params![position as i64, name, field_type],
        )?;
    }
    Ok(())
}

/// Applies `edit` to every stored attribute vector.
fn rewrite_attributes(
    tx: &Transaction,
    mut edit: impl FnMut(&mut Vec<FieldValue>),
) -> Result<(), StorageError> {
    let rows: Vec<(i64, Vec<u8>)> = {
        let mut stmt = tx.prepare("SELECT fid, attributes FROM features")?;
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?
    };
    for (fid, bytes) in rows {
        let mut values = decode_attributes(&bytes)?;
        edit(&mut values);
        tx.execute(
            "UPDATE features SET attributes = ?1 WHERE fid = ?2",
            rusqlite::params![encode_attributes(&values)?, fid],
        )?;
    }
    Ok(())
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }
}

impl FeatureStore for SqliteStore {
    fn fields(&self) -> Result<Vec<FieldDef>, StorageError> {
        read_field_rows(&self.conn)?
            .into_iter()
            .enumerate()
            .map(|(i, (name, field_type))| {
                Ok(FieldDef::new(name, FieldType::parse(&field_type)?)
                    .with_origin(FieldOrigin::Store { store_index: i }))
            })
            .collect()
    }

    fn feature_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM features", [], |row| row.get(0))?;
        u64::try_from(count).map_err(|_| StorageError::Serialization(format!("negative row count {}", count)))
    }

    fn get_features(&self, request: &FeatureRequest) -> Result<Vec<Feature>, StorageError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(fids) = request.fid_filter() {
            // Ids past the rowid range cannot match any row.
            let ids: Vec<i64> = fids.iter().filter_map(|f| rowid(*f).ok()).collect();
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; ids.len()].join(", ");
            clauses.push(format!("fid IN ({})", placeholders));
            params.extend(ids.into_iter().map(rusqlite::types::Value::Integer));
        }
        if let Some(rect) = &request.rect {
            clauses.push("xmax >= ? AND xmin <= ? AND ymax >= ? AND ymin <= ?".into());
            params.extend(
                [rect.xmin, rect.xmax, rect.ymin, rect.ymax]
                    .into_iter()
                    .map(rusqlite::types::Value::Real),
            );
        }

        let mut sql = String::from("SELECT fid, attributes, geometry FROM features");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY fid");
        if let Some(limit) = request.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows: Vec<(i64, Vec<u8>, Option<Vec<u8>>)> = stmt
            .query_map(rusqlite::params_from_iter(params), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(fid, attributes, geometry)| {
                let mut feature =
                    Feature::new(decode_attributes(&attributes)?).with_id(feature_id(fid)?);
                feature.geometry = decode_geometry(geometry)?;
                Ok(feature)
            })
            .collect()
    }

    fn add_features(&mut self, features: &mut [Feature]) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        let expected = field_count(&tx)?;
        for feature in features.iter() {
            if feature.attributes.len() != expected {
                return Err(StorageError::SchemaMismatch {
                    expected,
                    actual: feature.attributes.len(),
                });
            }
        }
        let mut assigned = Vec::with_capacity(features.len());
        for feature in features.iter() {
            let [xmin, ymin, xmax, ymax] = bbox_params(feature.geometry.as_ref());
            tx.execute(
                "INSERT INTO features (attributes, geometry, xmin, ymin, xmax, ymax) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    encode_attributes(&feature.attributes)?,
                    encode_geometry(feature.geometry.as_ref())?,
                    xmin,
                    ymin,
                    xmax,
                    ymax,
                ],
            )?;
            assigned.push(feature_id(tx.last_insert_rowid())?);
        }
        tx.commit()?;
        for (feature, id) in features.iter_mut().zip(assigned) {
            feature.id = id;
        }
        debug!("sqlite store inserted {} features", features.len());
        Ok(())
    }

    fn delete_features(&mut self, fids: &[FeatureId]) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        for fid in fids {
            let changed = tx.execute(
                "DELETE FROM features WHERE fid = ?1",
                rusqlite::params![rowid(*fid)?],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound(format!("feature {}", fid)));
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn change_attribute_values(&mut self, changes: &AttributeChanges) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        for (fid, values) in changes {
            let id = rowid(*fid)?;
            let bytes: Vec<u8> = tx
                .query_row(
                    "SELECT attributes FROM features WHERE fid = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        StorageError::NotFound(format!("feature {}", fid))
                    }
                    other => StorageError::Sqlite(other),
                })?;
            let mut attributes = decode_attributes(&bytes)?;
            for (index, value) in values {
                let slot = attributes
                    .get_mut(*index)
                    .ok_or_else(|| StorageError::NotFound(format!("field {}", index)))?;
                *slot = value.clone();
            }
            tx.execute(
                "UPDATE features SET attributes = ?1 WHERE fid = ?2",
                rusqlite::params![encode_attributes(&attributes)?, id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn change_geometries(&mut self, changes: &GeometryChanges) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        for (fid, geometry) in changes {
            let [xmin, ymin, xmax, ymax] = bbox_params(Some(geometry));
            let changed = tx.execute(
                "UPDATE features SET geometry = ?1, xmin = ?2, ymin = ?3, xmax = ?4, ymax = ?5 WHERE fid = ?6",
                rusqlite::params![
                    encode_geometry(Some(geometry))?,
                    xmin,
                    ymin,
                    xmax,
                    ymax,
                    rowid(*fid)?,
                ],
            )?;
            if changed == 0 {
                return Err(StorageError::NotFound(format!("feature {}", fid)));
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn add_attributes(&mut self, fields: &[FieldDef]) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        let mut rows = read_field_rows(&tx)?;
        for field in fields {
            if field.name.is_empty() || rows.iter().any(|(name, _)| *name == field.name) {
                return Err(StorageError::ConstraintViolation(format!(
                    "invalid or duplicate field name '{}'",
                    field.name
                )));
            }
            rows.push((field.name.clone(), field.field_type.as_str().to_string()));
        }
        write_field_rows(&tx, &rows)?;
        let width = rows.len();
        rewrite_attributes(&tx, |values| values.resize(width, FieldValue::Null))?;
        tx.commit()?;
        Ok(())
    }

    fn delete_attributes(&mut self, indices: &BTreeSet<usize>) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        let mut rows = read_field_rows(&tx)?;
        if let Some(index) = indices.iter().find(|i| **i >= rows.len()) {
            return Err(StorageError::NotFound(format!("field {}", index)));
        }
        for index in indices.iter().rev() {
            rows.remove(*index);
        }
        write_field_rows(&tx, &rows)?;
        rewrite_attributes(&tx, |values| {
            for index in indices.iter().rev() {
                if *index < values.len() {
                    values.remove(*index);
                }
            }
        })?;
        tx.commit()?;
        Ok(())
    }

    fn rename_attributes(&mut self, renames: &BTreeMap<usize, String>) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        let mut rows = read_field_rows(&tx)?;
        for (index, name) in renames {
            let row = rows
                .get_mut(*index)
                .ok_or_else(|| StorageError::NotFound(format!("field {}", index)))?;
            row.0 = name.clone();
        }
        let unique: BTreeSet<&String> = rows.iter().map(|(name, _)| name).collect();
        if unique.len() != rows.len() {
            return Err(StorageError::ConstraintViolation(
                "rename produces duplicate field names".into(),
            ));
        }
        write_field_rows(&tx, &rows)?;
        tx.commit()?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}
