//! Property-based tests for the state machine
//!
//! These tests verify key invariants hold across all possible inputs.

use super::event::Directive;
use super::state::*;
use super::transition::*;
use super::*;
use proptest::prelude::*;

// ============================================================================
// Test Helpers
// ============================================================================

const OWNER: UserId = 1;

/// Commit a result the way the store does: Idle clears, anything else merges
fn commit(record: &StateRecord, result: &TransitionResult) -> StateRecord {
    if result.new_state.is_idle() {
        return StateRecord::idle(record.user_id);
    }
    let mut payload = record.payload.clone();
    payload.extend(result.patch.clone());
    StateRecord::new(record.user_id, result.new_state, payload)
}

/// A record whose payload is consistent with its state
fn seeded(state: ConversationState, target: UserId, text: &str) -> StateRecord {
    let payload = match state {
        ConversationState::Idle => Payload::new(),
        ConversationState::AwaitingBroadcastText => mode_payload(Mode::Broadcast),
        ConversationState::AwaitingTargetSelector => mode_payload(Mode::Direct),
        ConversationState::AwaitingMessageToUser => target_payload(target, Mode::Direct),
        ConversationState::AwaitingReplyToUser => target_payload(target, Mode::Reply),
        ConversationState::AwaitingSendConfirmation => {
            PendingAction::direct(target, Content::text(text)).to_payload()
        }
    };
    StateRecord::new(OWNER, state, payload)
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_state() -> impl Strategy<Value = ConversationState> {
    proptest::sample::select(ConversationState::ALL.to_vec())
}

fn arb_non_idle_state() -> impl Strategy<Value = ConversationState> {
    proptest::sample::select(ConversationState::ALL[1..].to_vec())
}

fn arb_user_id() -> impl Strategy<Value = UserId> {
    1i64..1_000_000
}

fn arb_media_kind() -> impl Strategy<Value = MediaKind> {
    prop_oneof![
        Just(MediaKind::Photo),
        Just(MediaKind::Video),
        Just(MediaKind::Document),
        Just(MediaKind::Audio),
        Just(MediaKind::Voice),
        Just(MediaKind::Sticker),
    ]
}

fn arb_media() -> impl Strategy<Value = MediaRef> {
    (arb_media_kind(), "[A-Za-z0-9_-]{8,16}").prop_map(|(kind, id)| MediaRef::new(kind, id))
}

fn arb_token_text() -> impl Strategy<Value = String> {
    prop_oneof![
        proptest::sample::select(Directive::MENU.to_vec()).prop_map(String::from),
        proptest::sample::select(Directive::CONFIRMATION.to_vec()).prop_map(String::from),
        Just("@someone".to_string()),
        arb_user_id().prop_map(|id| id.to_string()),
    ]
}

fn arb_free_text() -> impl Strategy<Value = String> {
    "[a-zA-Z ]{1,30}"
}

fn arb_button() -> impl Strategy<Value = ButtonAction> {
    prop_oneof![
        arb_user_id().prop_map(ButtonAction::Reply),
        arb_user_id().prop_map(ButtonAction::Block),
        arb_user_id().prop_map(ButtonAction::Unblock),
        Just(ButtonAction::CheckMembership),
    ]
}

fn arb_input() -> impl Strategy<Value = OwnerInput> {
    prop_oneof![
        3 => arb_token_text().prop_map(OwnerInput::Text),
        2 => arb_free_text().prop_map(OwnerInput::Text),
        1 => arb_media().prop_map(OwnerInput::Media),
        1 => arb_button().prop_map(OwnerInput::Button),
        1 => Just(OwnerInput::Command(Command::Cancel)),
        1 => Just(OwnerInput::Command(Command::Start)),
        1 => arb_user_id().prop_map(|user_id| OwnerInput::TargetResolved { user_id }),
    ]
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    // Any accepted step follows a legal edge or stays put
    #[test]
    fn prop_transitions_follow_graph(inputs in proptest::collection::vec(arb_input(), 0..25)) {
        let mut record = StateRecord::idle(OWNER);

        for input in inputs {
            if let Ok(result) = transition(&record, input) {
                prop_assert!(
                    result.new_state == record.state
                        || can_transition(record.state, result.new_state),
                    "Illegal edge {} -> {}",
                    record.state,
                    result.new_state
                );
                record = commit(&record, &result);
            }
        }
    }

    // Every non-idle state can be cancelled back to Idle, by text or command
    #[test]
    fn prop_cancel_always_reaches_idle(
        state in arb_non_idle_state(),
        target in arb_user_id(),
        by_command in any::<bool>(),
    ) {
        let record = seeded(state, target, "pending");
        let input = if by_command {
            OwnerInput::Command(Command::Cancel)
        } else {
            OwnerInput::Text("Cancel".to_string())
        };
        let result = transition(&record, input);
        prop_assert!(result.is_ok(), "Cancel failed: {:?}", result);
        let result = result.unwrap();
        prop_assert_eq!(result.new_state, ConversationState::Idle);
        prop_assert!(
            !result.effects.iter().any(|e| matches!(e, Effect::Deliver { .. } | Effect::Broadcast { .. })),
            "Cancel must not send anything"
        );
    }

    // Nothing but confirm or cancel leaves the confirmation state
    #[test]
    fn prop_confirmation_holds_on_other_text(text in arb_free_text(), target in arb_user_id()) {
        prop_assume!(Directive::parse(&text).is_none());
        let record = seeded(ConversationState::AwaitingSendConfirmation, target, "pending");
        let result = transition(&record, OwnerInput::Text(text)).unwrap();
        prop_assert_eq!(result.new_state, ConversationState::AwaitingSendConfirmation);
        prop_assert!(result.patch.is_empty());
    }

    #[test]
    fn prop_confirmation_holds_on_media(media in arb_media(), target in arb_user_id()) {
        let record = seeded(ConversationState::AwaitingSendConfirmation, target, "pending");
        let result = transition(&record, OwnerInput::Media(media)).unwrap();
        prop_assert_eq!(result.new_state, ConversationState::AwaitingSendConfirmation);
    }

    // Confirming a direct message delivers exactly the staged action
    #[test]
    fn prop_confirm_delivers_staged_action(target in arb_user_id(), text in arb_free_text()) {
        let record = seeded(ConversationState::AwaitingSendConfirmation, target, &text);
        let result = transition(&record, OwnerInput::Text("confirm".to_string())).unwrap();
        prop_assert_eq!(result.new_state, ConversationState::Idle);
        let delivered: Vec<_> = result
            .effects
            .iter()
            .filter_map(|e| match e {
                Effect::Deliver { action } => Some(action.clone()),
                _ => None,
            })
            .collect();
        prop_assert_eq!(delivered, vec![PendingAction::direct(target, Content::text(text))]);
    }

    // Staging in a compose state always records the preset target
    #[test]
    fn prop_compose_keeps_target(
        reply in any::<bool>(),
        target in arb_user_id(),
        media in arb_media(),
    ) {
        let state = if reply {
            ConversationState::AwaitingReplyToUser
        } else {
            ConversationState::AwaitingMessageToUser
        };
        let record = seeded(state, target, "");
        let result = transition(&record, OwnerInput::Media(media.clone())).unwrap();
        prop_assert_eq!(result.new_state, ConversationState::AwaitingSendConfirmation);
        let staged = commit(&record, &result).pending_action().unwrap();
        prop_assert_eq!(staged.target_user_id, Some(target));
        prop_assert_eq!(staged.content, Content::Media(media));
        prop_assert_eq!(staged.label, if reply { Label::Reply } else { Label::Message });
    }

    // Block and unblock never move the conversation
    #[test]
    fn prop_block_is_stateless(state in arb_state(), user in arb_user_id(), block in any::<bool>()) {
        let record = seeded(state, 7, "pending");
        let action = if block { ButtonAction::Block(user) } else { ButtonAction::Unblock(user) };
        let result = transition(&record, OwnerInput::Button(action)).unwrap();
        prop_assert_eq!(result.new_state, state);
        prop_assert_eq!(result.effects, vec![Effect::SetBlocked { user_id: user, blocked: block }]);
    }

    // Transitions are deterministic
    #[test]
    fn prop_transition_is_pure(state in arb_state(), input in arb_input()) {
        let record = seeded(state, 42, "pending");
        prop_assert_eq!(transition(&record, input.clone()), transition(&record, input));
    }
}
