//! Capability checks shared by every scheduler and accounting operation.

use crate::types::{Actor, Role, UserId};

/// Entities that belong to exactly one student and one tutor.
pub trait Participants {
    fn student_id(&self) -> &UserId;
    fn tutor_id(&self) -> &UserId;
}

/// The standing an actor has with respect to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Standing {
    /// The actor is the entity's student or tutor, acting in that role.
    Participant,
    /// The actor is an admin.
    Admin,
    /// No standing at all.
    None,
}

impl Standing {
    /// Participants and admins may act; everyone else is forbidden.
    #[must_use]
    pub const fn may_act(self) -> bool {
        matches!(self, Self::Participant | Self::Admin)
    }
}

/// Classifies `actor` against `entity`.
///
/// A user only counts as a participant when acting in the role they hold on
/// the entity, so a tutor id in the student slot does not qualify.
pub fn can_act_on<P: Participants + ?Sized>(actor: &Actor, entity: &P) -> Standing {
    match actor.role {
        Role::Admin => Standing::Admin,
        Role::Student if actor.id == *entity.student_id() => Standing::Participant,
        Role::Tutor if actor.id == *entity.tutor_id() => Standing::Participant,
        Role::Student | Role::Tutor => Standing::None,
    }
}

/// The actor is the entity's tutor.
pub fn is_tutor_of<P: Participants + ?Sized>(actor: &Actor, entity: &P) -> bool {
    actor.role == Role::Tutor && actor.id == *entity.tutor_id()
}
