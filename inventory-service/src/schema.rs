diesel::table! {
    stocks (product_id) {
        product_id -> Int4,
        quantity -> Int4,
        version -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        deleted_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    sell_ledger (order_serial) {
        order_serial -> Varchar,
        state -> Varchar,
        detail -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    stocks,
    sell_ledger,
);
