diesel::table! {
    network_outbox (id) {
        id -> BigInt,
        owner_id -> Text,
        channel -> Text,
        data -> Text,
        target -> Text,
        target_server -> Nullable<Text>,
        created_at -> BigInt,
        attempts -> Integer,
        last_attempt_at -> BigInt,
    }
}
