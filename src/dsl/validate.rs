//! Structural validation of raw DSL documents.
//!
//! Runs before any SQL is emitted. Violations carry a
//! `/<instruction>/<index>[/<path>]` pointer and a deterministic message so
//! external tools can match on them.

use error_stack::Report;
use serde_yaml::{Mapping, Value};

use crate::dsl::{names, ValidationError};

pub(crate) fn validate(value: &Value) -> Result<(), Report<ValidationError>> {
    let mut validator = Validator::default();
    validator.document(value);
    validator.finish()
}

fn lookup<'a>(map: &'a Mapping, property: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(key, _)| key.as_str() == Some(property))
        .map(|(_, value)| value)
}

#[derive(Default)]
struct Validator {
    errors: Vec<ValidationError>,
}

impl Validator {
    fn finish(self) -> Result<(), Report<ValidationError>> {
        let mut errors = self.errors.into_iter();
        let Some(first) = errors.next() else {
            return Ok(());
        };
        let mut report = Report::new(first);
        for error in errors {
            report = report.attach_printable(error);
        }
        Err(report)
    }

    fn error(&mut self, pointer: impl Into<String>, detail: impl Into<String>) {
        self.errors.push(ValidationError::new(pointer, detail));
    }

    fn document(&mut self, value: &Value) {
        let Value::Mapping(mapping) = value else {
            self.error("", "must be object");
            return;
        };

        for (key, entry) in mapping {
            let Some(key) = key.as_str() else {
                self.error("", "must have string instruction keys");
                continue;
            };
            match key {
                "define_entities" => self.instruction(key, entry, Self::entity),
                "add_projections" => self.instruction(key, entry, Self::projection),
                "add_change_set" => self.instruction(key, entry, Self::change_set),
                "add_hooks" => self.instruction(key, entry, Self::hook),
                _ => self.error(
                    format!("/{key}"),
                    "must be one of 'define_entities', 'add_projections', 'add_change_set', \
                     'add_hooks'",
                ),
            }
        }
    }

    fn instruction(&mut self, name: &str, value: &Value, check: fn(&mut Self, &str, &Mapping)) {
        let Value::Sequence(items) = value else {
            self.error(format!("/{name}"), "must be array");
            return;
        };
        for (index, item) in items.iter().enumerate() {
            let pointer = format!("/{name}/{index}");
            let Value::Mapping(item) = item else {
                self.error(pointer, "must be object");
                continue;
            };
            check(self, &pointer, item);
        }
    }

    fn required_string(&mut self, pointer: &str, map: &Mapping, property: &str) -> Option<String> {
        match lookup(map, property) {
            None => {
                self.error(pointer, format!("must have required property '{property}'"));
                None
            }
            Some(Value::String(value)) => Some(value.clone()),
            Some(_) => {
                self.error(format!("{pointer}/{property}"), "must be string");
                None
            }
        }
    }

    fn required_version(&mut self, pointer: &str, map: &Mapping, property: &str) -> Option<i64> {
        match lookup(map, property) {
            None => {
                self.error(pointer, format!("must have required property '{property}'"));
                None
            }
            Some(value) => self.version_value(&format!("{pointer}/{property}"), value),
        }
    }

    fn version_value(&mut self, pointer: &str, value: &Value) -> Option<i64> {
        match value.as_i64() {
            Some(version) if (1..=i64::from(i32::MAX)).contains(&version) => Some(version),
            Some(_) => {
                self.error(pointer, "must be >= 1");
                None
            }
            None => {
                self.error(pointer, "must be integer");
                None
            }
        }
    }

    fn required_items<'a>(
        &mut self,
        pointer: &str,
        map: &'a Mapping,
        property: &str,
    ) -> Option<&'a [Value]> {
        match lookup(map, property) {
            None => {
                self.error(pointer, format!("must have required property '{property}'"));
                None
            }
            Some(Value::Sequence(items)) => {
                if items.is_empty() {
                    self.error(
                        format!("{pointer}/{property}"),
                        "must NOT have fewer than 1 items",
                    );
                    None
                } else {
                    Some(items)
                }
            }
            Some(_) => {
                self.error(format!("{pointer}/{property}"), "must be array");
                None
            }
        }
    }

    fn field_name(&mut self, pointer: &str, name: &str) {
        if !names::identifier_regex().is_match(name) {
            self.error(
                pointer,
                format!("must match pattern '{}'", names::IDENTIFIER_PATTERN),
            );
        } else if name.starts_with("rdf_") {
            self.error(pointer, "must NOT use the reserved prefix 'rdf_'");
        }
    }

    fn entity(&mut self, pointer: &str, map: &Mapping) {
        if let Some(name) = self.required_string(pointer, map, "name") {
            if names::entity_table_name(&name, 1).is_err() {
                self.error(
                    format!("{pointer}/name"),
                    "must be representable as a SQL identifier",
                );
            }
        }
        self.required_version(pointer, map, "version");

        let mut declared = Vec::new();
        if let Some(fields) = self.required_items(pointer, map, "fields") {
            for (index, field) in fields.iter().enumerate() {
                let pointer = format!("{pointer}/fields/{index}");
                let Value::Mapping(field) = field else {
                    self.error(pointer, "must be object");
                    continue;
                };
                if let Some(name) = self.required_string(&pointer, field, "name") {
                    self.field_name(&format!("{pointer}/name"), &name);
                    declared.push(name);
                }
                self.required_string(&pointer, field, "type");
            }
        }

        if let Some(identifiers) = self.required_items(pointer, map, "identified_by") {
            for (index, identifier) in identifiers.iter().enumerate() {
                let pointer = format!("{pointer}/identified_by/{index}");
                match identifier.as_str() {
                    None => self.error(pointer, "must be string"),
                    Some(name) if !declared.iter().any(|field| field == name) => {
                        self.error(pointer, "must be equal to one of the declared fields");
                    }
                    Some(_) => {}
                }
            }
        }
    }

    fn projection(&mut self, pointer: &str, map: &Mapping) {
        self.required_string(pointer, map, "name");
        self.required_version(pointer, map, "version");

        if let Some(dependencies) = self.required_items(pointer, map, "dependencies") {
            for (index, dependency) in dependencies.iter().enumerate() {
                let pointer = format!("{pointer}/dependencies/{index}");
                let Value::Mapping(dependency) = dependency else {
                    self.error(pointer, "must be object");
                    continue;
                };
                self.required_string(&pointer, dependency, "entity");
                self.required_version(&pointer, dependency, "version");
            }
        }
    }

    fn change_set(&mut self, pointer: &str, map: &Mapping) {
        match lookup(map, "description") {
            None | Some(Value::Null | Value::String(_)) => {}
            Some(_) => self.error(format!("{pointer}/description"), "must be string"),
        }

        if let Some(effective) = self.required_string(pointer, map, "effective") {
            if time::OffsetDateTime::parse(
                &effective,
                &time::format_description::well_known::Rfc3339,
            )
            .is_err()
            {
                self.error(
                    format!("{pointer}/effective"),
                    "must match format 'date-time'",
                );
            }
        }

        if let Some(frames) = self.required_items(pointer, map, "frames") {
            for (index, frame) in frames.iter().enumerate() {
                let pointer = format!("{pointer}/frames/{index}");
                let Value::Mapping(frame) = frame else {
                    self.error(pointer, "must be object");
                    continue;
                };
                self.frame(&pointer, frame);
            }
        }
    }

    fn frame(&mut self, pointer: &str, frame: &Mapping) {
        self.required_string(pointer, frame, "entity");
        self.required_version(pointer, frame, "version");

        match lookup(frame, "action") {
            None => self.error(pointer, "must have required property 'action'"),
            Some(Value::String(action)) if action == "POST" || action == "DELETE" => {}
            Some(_) => self.error(
                format!("{pointer}/action"),
                "must be equal to one of the allowed values 'POST', 'DELETE'",
            ),
        }

        if let Some(rows) = self.required_items(pointer, frame, "data") {
            for (index, row) in rows.iter().enumerate() {
                let pointer = format!("{pointer}/data/{index}");
                let Value::Mapping(row) = row else {
                    self.error(pointer, "must be object");
                    continue;
                };
                for (key, value) in row {
                    let Some(key) = key.as_str() else {
                        self.error(pointer.clone(), "must have string field names");
                        continue;
                    };
                    self.field_name(&format!("{pointer}/{key}"), key);
                    match value {
                        Value::Null | Value::Bool(_) | Value::String(_) => {}
                        Value::Number(number) => {
                            if number.as_f64().is_some_and(|float| !float.is_finite()) {
                                self.error(
                                    format!("{pointer}/{key}"),
                                    "must be a finite number",
                                );
                            }
                        }
                        _ => self.error(format!("{pointer}/{key}"), "must be a scalar value"),
                    }
                }
            }
        }
    }

    fn hook(&mut self, pointer: &str, map: &Mapping) {
        self.required_string(pointer, map, "name");
        self.required_string(pointer, map, "event");

        let projection = match lookup(map, "projection") {
            None | Some(Value::Null) => None,
            Some(Value::String(name)) => Some(name.clone()),
            Some(_) => {
                self.error(format!("{pointer}/projection"), "must be string");
                return;
            }
        };
        let version = match lookup(map, "version") {
            None | Some(Value::Null) => None,
            Some(value) => self.version_value(&format!("{pointer}/version"), value),
        };

        // A hook either names a projection version or is a wildcard.
        match (projection, version) {
            (Some(_), None) if lookup(map, "version").is_none() => {
                self.error(pointer, "must have required property 'version'");
            }
            (None, Some(_)) => {
                self.error(pointer, "must have required property 'projection'");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use crate::dsl;

    fn first_error(source: &str) -> String {
        dsl::parse(source)
            .expect_err("document should be rejected")
            .current_context()
            .to_string()
    }

    #[test]
    fn accepts_a_complete_document() {
        let document = dsl::parse(indoc! {"
            define_entities:
              - name: VAT Rate
                version: 1
                fields:
                  - name: type
                    type: TEXT
                  - name: rate
                    type: NUMERIC
                identified_by:
                  - type
            add_projections:
              - name: VAT Rates
                version: 1
                dependencies:
                  - entity: VAT Rate
                    version: 1
            add_change_set:
              - description: 2020 rates
                effective: 2020-04-05T00:00:00Z
                frames:
                  - entity: VAT Rate
                    version: 1
                    action: POST
                    data:
                      - type: standard
                        rate: 0.10
            add_hooks:
              - name: notify-vat
                event: VAT Rate Changed
                projection: VAT Rates
                version: 1
              - name: notify-any
                event: Any Change
        "})
        .expect("document should validate");

        assert_eq!(document.define_entities.len(), 1);
        assert_eq!(document.define_entities[0].identified_by, vec!["type"]);
        assert_eq!(document.add_change_set[0].frames[0].data.len(), 1);
        assert_eq!(document.add_hooks[1].projection, None);
    }

    #[test]
    fn missing_effective_is_pinpointed() {
        let message = first_error(indoc! {"
            add_change_set:
              - description: no effective date
                frames:
                  - entity: VAT Rate
                    version: 1
                    action: POST
                    data:
                      - type: standard
        "});
        assert_eq!(
            message,
            "/add_change_set/0 must have required property 'effective'"
        );
    }

    #[test]
    fn unknown_instructions_are_rejected() {
        let message = first_error("drop_everything:\n  - name: nope\n");
        assert_eq!(
            message,
            "/drop_everything must be one of 'define_entities', 'add_projections', \
             'add_change_set', 'add_hooks'"
        );
    }

    #[test]
    fn action_enum_is_enforced() {
        let message = first_error(indoc! {"
            add_change_set:
              - effective: 2020-04-05T00:00:00Z
                frames:
                  - entity: VAT Rate
                    version: 1
                    action: PATCH
                    data:
                      - type: standard
        "});
        assert_eq!(
            message,
            "/add_change_set/0/frames/0/action must be equal to one of the allowed values \
             'POST', 'DELETE'"
        );
    }

    #[test]
    fn non_array_instructions_are_rejected() {
        let message = first_error("define_entities: yes\n");
        assert_eq!(message, "/define_entities must be array");
    }

    #[test]
    fn fields_must_not_be_empty() {
        let message = first_error(indoc! {"
            define_entities:
              - name: Park
                version: 1
                fields: []
                identified_by:
                  - code
        "});
        assert_eq!(
            message,
            "/define_entities/0/fields must NOT have fewer than 1 items"
        );
    }

    #[test]
    fn identifiers_must_be_declared_fields() {
        let message = first_error(indoc! {"
            define_entities:
              - name: Park
                version: 1
                fields:
                  - name: code
                    type: TEXT
                identified_by:
                  - name
        "});
        assert_eq!(
            message,
            "/define_entities/0/identified_by/0 must be equal to one of the declared fields"
        );
    }

    #[test]
    fn malformed_effective_dates_are_rejected() {
        let message = first_error(indoc! {"
            add_change_set:
              - effective: not-a-date
                frames:
                  - entity: VAT Rate
                    version: 1
                    action: POST
                    data:
                      - type: standard
        "});
        assert_eq!(
            message,
            "/add_change_set/0/effective must match format 'date-time'"
        );
    }

    #[test]
    fn hooks_cannot_name_a_projection_without_a_version() {
        let message = first_error(indoc! {"
            add_hooks:
              - name: half-specified
                event: Any Change
                projection: VAT Rates
        "});
        assert_eq!(message, "/add_hooks/0 must have required property 'version'");
    }

    #[test]
    fn reserved_field_prefix_is_rejected() {
        let message = first_error(indoc! {"
            define_entities:
              - name: Park
                version: 1
                fields:
                  - name: rdf_code
                    type: TEXT
                identified_by:
                  - rdf_code
        "});
        assert_eq!(
            message,
            "/define_entities/0/fields/0/name must NOT use the reserved prefix 'rdf_'"
        );
    }

    #[test]
    fn every_violation_is_reported() {
        let report = dsl::parse(indoc! {"
            add_projections:
              - version: 1
                dependencies:
                  - entity: VAT Rate
                    version: 1
              - name: Parks
                dependencies: []
        "})
        .expect_err("document should be rejected");

        let rendered = format!("{report:?}");
        assert!(rendered.contains("/add_projections/0 must have required property 'name'"));
        assert!(rendered.contains("/add_projections/1 must have required property 'version'"));
        assert!(
            rendered.contains("/add_projections/1/dependencies must NOT have fewer than 1 items")
        );
    }
}
