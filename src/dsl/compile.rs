//! SQL emission for validated DSL documents.
//!
//! Everything here is pure string generation; execution happens in
//! [`apply`](crate::dsl::apply) inside the migration transaction. Field names
//! reaching this module have already matched the identifier grammar, and data
//! values are scalars.

use std::collections::BTreeMap;

use error_stack::Report;

use crate::dsl::{
    document::EntityDef,
    names::{self, InvalidIdentifier},
};

/// DDL for an entity version's side table.
///
/// Identifier columns are `NOT NULL`: every frame must carry them, while
/// non-identifier fields may be omitted on DELETE frames. Rows live and die
/// with their data frame.
pub(crate) fn side_table_ddl(entity: &EntityDef) -> Result<String, Report<InvalidIdentifier>> {
    let table = names::entity_table_name(&entity.name, entity.version)?;

    let mut columns = vec![
        "    rdf_frame_id INT PRIMARY KEY REFERENCES fby_data_frame (id) ON DELETE CASCADE"
            .to_owned(),
    ];
    for field in &entity.fields {
        let not_null = if entity.identified_by.contains(&field.name) {
            " NOT NULL"
        } else {
            ""
        };
        columns.push(format!(
            "    {} {}{not_null}",
            names::quote_field(&field.name),
            field.column_type
        ));
    }

    Ok(format!(
        "CREATE TABLE {table} (\n{}\n);",
        columns.join(",\n")
    ))
}

/// DDL for the generated point-in-time aggregate function.
///
/// For each identifier tuple the latest frame in `(effective, id, frame id)`
/// order wins; tuples whose winning frame is a DELETE are omitted.
pub(crate) fn aggregate_function_ddl(
    entity: &EntityDef,
) -> Result<String, Report<InvalidIdentifier>> {
    let table = names::entity_table_name(&entity.name, entity.version)?;
    let function = names::aggregate_function_name(&entity.name, entity.version)?;

    let returns = entity
        .fields
        .iter()
        .map(|field| format!("{} {}", names::quote_field(&field.name), field.column_type))
        .collect::<Vec<_>>()
        .join(", ");
    let outputs = entity
        .fields
        .iter()
        .map(|field| format!("x.{}", names::quote_field(&field.name)))
        .collect::<Vec<_>>()
        .join(", ");
    let inputs = entity
        .fields
        .iter()
        .map(|field| format!("t.{}", names::quote_field(&field.name)))
        .collect::<Vec<_>>()
        .join(", ");
    let identifiers = entity
        .identified_by
        .iter()
        .map(|identifier| format!("t.{}", names::quote_field(identifier)))
        .collect::<Vec<_>>()
        .join(", ");

    Ok(format!(
        "CREATE OR REPLACE FUNCTION {function}(p_change_set_id INT)\n\
         RETURNS TABLE ({returns}) AS $$\n\
         \x20   SELECT {outputs}\n\
         \x20   FROM (\n\
         \x20       SELECT DISTINCT ON ({identifiers}) {inputs}, f.action AS rdf_action\n\
         \x20       FROM {table} t\n\
         \x20       INNER JOIN fby_data_frame f ON f.id = t.rdf_frame_id\n\
         \x20       INNER JOIN fby_change_set c ON c.id = f.change_set_id\n\
         \x20       WHERE (c.effective, c.id) <= (\n\
         \x20           SELECT b.effective, b.id FROM fby_change_set b WHERE b.id = p_change_set_id\n\
         \x20       )\n\
         \x20       ORDER BY {identifiers}, c.effective DESC, c.id DESC, f.id DESC\n\
         \x20   ) x\n\
         \x20   WHERE x.rdf_action <> 'DELETE';\n\
         $$ LANGUAGE sql;"
    ))
}

/// INSERT for one data row of a frame. Values are rendered as SQL literals
/// and coerced by the database to the declared column types.
pub(crate) fn frame_row_insert(
    table: &str,
    frame_id: i32,
    row: &BTreeMap<String, serde_yaml::Value>,
) -> Result<String, Report<InvalidIdentifier>> {
    let mut columns = vec!["rdf_frame_id".to_owned()];
    let mut values = vec![frame_id.to_string()];
    for (field, value) in row {
        if !names::identifier_regex().is_match(field) {
            return Err(Report::new(InvalidIdentifier).attach_printable(field.clone()));
        }
        columns.push(names::quote_field(field));
        values.push(scalar_literal(value)?);
    }

    Ok(format!(
        "INSERT INTO {table} ({}) VALUES ({});",
        columns.join(", "),
        values.join(", ")
    ))
}

fn scalar_literal(value: &serde_yaml::Value) -> Result<String, Report<InvalidIdentifier>> {
    match value {
        serde_yaml::Value::Null => Ok("NULL".to_owned()),
        serde_yaml::Value::Bool(true) => Ok("TRUE".to_owned()),
        serde_yaml::Value::Bool(false) => Ok("FALSE".to_owned()),
        serde_yaml::Value::Number(number) => Ok(number.to_string()),
        serde_yaml::Value::String(text) => Ok(format!("'{}'", text.replace('\'', "''"))),
        _ => Err(Report::new(InvalidIdentifier).attach_printable("expected a scalar value")),
    }
}
