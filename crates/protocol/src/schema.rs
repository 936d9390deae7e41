//! Static payload schemas, one per (operator, command) pair.
//!
//! The wire format is positional: a decoder must know, from the opcode
//! pair alone, exactly which typed fields follow and which of them are
//! optional. Keeping that knowledge in one table (instead of paired
//! read/write call sites) removes the class of desync bugs where one side
//! drifts out of order with the other.

use crate::frame::{character, cleanup, creation, modification, query, report, Operator};
use crate::wire::WireType;

/// One payload field: its wire type and whether it is preceded by a
/// packed presence flag.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: WireType,
    pub optional: bool,
}

/// Payload layout for one command.
#[derive(Debug, Clone, Copy)]
pub struct CommandSchema {
    pub operator: Operator,
    pub command: u8,
    pub fields: &'static [FieldSpec],
}

const fn req(name: &'static str, ty: WireType) -> FieldSpec {
    FieldSpec {
        name,
        ty,
        optional: false,
    }
}

const fn opt(name: &'static str, ty: WireType) -> FieldSpec {
    FieldSpec {
        name,
        ty,
        optional: true,
    }
}

const CREATE_BODY: CommandSchema = CommandSchema {
    operator: Operator::Creation,
    command: creation::CREATE_BODY,
    fields: &[
        req("index", WireType::U32),
        req("kind", WireType::U8),
        req("position", WireType::Vector3),
        req("rotation", WireType::Quaternion),
        opt("mass", WireType::F32),
        opt("linear_velocity", WireType::Vector3),
        opt("mesh", WireType::U16),
    ],
};

const SET_TRANSFORM: CommandSchema = CommandSchema {
    operator: Operator::Modification,
    command: modification::SET_TRANSFORM,
    fields: &[
        req("index", WireType::U32),
        opt("position", WireType::Vector3),
        opt("rotation", WireType::Quaternion),
    ],
};

const SET_LINEAR_VELOCITY: CommandSchema = CommandSchema {
    operator: Operator::Modification,
    command: modification::SET_LINEAR_VELOCITY,
    fields: &[req("index", WireType::U32), req("velocity", WireType::Vector3)],
};

const SET_ANGULAR_VELOCITY: CommandSchema = CommandSchema {
    operator: Operator::Modification,
    command: modification::SET_ANGULAR_VELOCITY,
    fields: &[req("index", WireType::U32), req("velocity", WireType::Vector3)],
};

const APPLY_IMPULSE: CommandSchema = CommandSchema {
    operator: Operator::Modification,
    command: modification::APPLY_IMPULSE,
    fields: &[
        req("index", WireType::U32),
        req("impulse", WireType::Vector3),
        opt("point", WireType::Vector3),
    ],
};

const SET_GRAVITY: CommandSchema = CommandSchema {
    operator: Operator::Modification,
    command: modification::SET_GRAVITY,
    fields: &[req("gravity", WireType::Vector3)],
};

const RAYCAST: CommandSchema = CommandSchema {
    operator: Operator::Query,
    command: query::RAYCAST,
    fields: &[
        req("ray_id", WireType::U32),
        req("from", WireType::Vector3),
        req("to", WireType::Vector3),
    ],
};

const DESTROY_BODY: CommandSchema = CommandSchema {
    operator: Operator::Cleanup,
    command: cleanup::DESTROY_BODY,
    fields: &[req("index", WireType::U32)],
};

const DESTROY_ALL: CommandSchema = CommandSchema {
    operator: Operator::Cleanup,
    command: cleanup::DESTROY_ALL,
    fields: &[],
};

const BODY_POSE: CommandSchema = CommandSchema {
    operator: Operator::Report,
    command: report::BODY_POSE,
    fields: &[
        req("index", WireType::U32),
        req("position", WireType::Vector3),
        req("rotation", WireType::Quaternion),
        req("linear_velocity", WireType::Vector3),
        req("angular_velocity", WireType::Vector3),
    ],
};

const RAYCAST_HIT: CommandSchema = CommandSchema {
    operator: Operator::Report,
    command: report::RAYCAST_HIT,
    fields: &[
        req("ray_id", WireType::U32),
        req("hit", WireType::Bool),
        opt("position", WireType::Vector3),
        opt("normal", WireType::Vector3),
        opt("body", WireType::U32),
    ],
};

const FATAL: CommandSchema = CommandSchema {
    operator: Operator::Report,
    command: report::FATAL,
    fields: &[],
};

const UPDATE_CONTROLLER: CommandSchema = CommandSchema {
    operator: Operator::Character,
    command: character::UPDATE_CONTROLLER,
    fields: &[
        req("index", WireType::U32),
        req("displacement", WireType::Vector3),
    ],
};

/// Looks up the payload schema for an opcode pair.
pub fn schema_for(operator: Operator, command: u8) -> Option<&'static CommandSchema> {
    let schema = match (operator, command) {
        (Operator::Creation, creation::CREATE_BODY) => &CREATE_BODY,
        (Operator::Modification, modification::SET_TRANSFORM) => &SET_TRANSFORM,
        (Operator::Modification, modification::SET_LINEAR_VELOCITY) => &SET_LINEAR_VELOCITY,
        (Operator::Modification, modification::SET_ANGULAR_VELOCITY) => &SET_ANGULAR_VELOCITY,
        (Operator::Modification, modification::APPLY_IMPULSE) => &APPLY_IMPULSE,
        (Operator::Modification, modification::SET_GRAVITY) => &SET_GRAVITY,
        (Operator::Query, query::RAYCAST) => &RAYCAST,
        (Operator::Cleanup, cleanup::DESTROY_BODY) => &DESTROY_BODY,
        (Operator::Cleanup, cleanup::DESTROY_ALL) => &DESTROY_ALL,
        (Operator::Report, report::BODY_POSE) => &BODY_POSE,
        (Operator::Report, report::RAYCAST_HIT) => &RAYCAST_HIT,
        (Operator::Report, report::FATAL) => &FATAL,
        (Operator::Character, character::UPDATE_CONTROLLER) => &UPDATE_CONTROLLER,
        _ => return None,
    };
    Some(schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_schema_registered_under_its_own_opcode() {
        let all = [
            &CREATE_BODY,
            &SET_TRANSFORM,
            &SET_LINEAR_VELOCITY,
            &SET_ANGULAR_VELOCITY,
            &APPLY_IMPULSE,
            &SET_GRAVITY,
            &RAYCAST,
            &DESTROY_BODY,
            &DESTROY_ALL,
            &BODY_POSE,
            &RAYCAST_HIT,
            &FATAL,
            &UPDATE_CONTROLLER,
        ];
        for schema in all {
            let found = schema_for(schema.operator, schema.command)
                .unwrap_or_else(|| panic!("{:?}/{} unregistered", schema.operator, schema.command));
            assert_eq!(found.fields.len(), schema.fields.len());
        }
    }

    #[test]
    fn test_unknown_command_has_no_schema() {
        assert!(schema_for(Operator::Query, 99).is_none());
    }
}
