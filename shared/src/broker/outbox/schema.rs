diesel::table! {
    broker_messages (id) {
        id -> Int8,
        topic -> Varchar,
        message_key -> Varchar,
        payload -> Jsonb,
        state -> Varchar,
        deliver_at -> Timestamptz,
        published_at -> Nullable<Timestamptz>,
        check_times -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}
