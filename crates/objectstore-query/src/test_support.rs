use objectstore_core::{FieldMapping, ForeignRelation, MappingRegistry, TableMapping};

/// people <- teams.owner, teams <- users.team
pub(crate) fn registry() -> MappingRegistry {
    let registry = MappingRegistry::new();
    registry
        .register(
            TableMapping::new("people")
                .field(FieldMapping::new("id").key(true))
                .field(FieldMapping::new("name"))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            TableMapping::new("teams")
                .field(FieldMapping::new("id").key(true))
                .field(FieldMapping::new("name"))
                .field(FieldMapping::new("owner_id"))
                .foreign(ForeignRelation::new("owner", "people").column("owner_id", "id"))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
        .register(
            TableMapping::new("users")
                .field(FieldMapping::new("id").key(true))
                .field(FieldMapping::new("name"))
                .field(FieldMapping::new("age"))
                .field(FieldMapping::new("active"))
                .field(FieldMapping::new("team_id").column("team"))
                .foreign(ForeignRelation::new("team", "teams").column("team_id", "id"))
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
}
