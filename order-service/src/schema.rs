diesel::table! {
    orders (id) {
        id -> Int4,
        order_serial -> Varchar,
        user_id -> Int4,
        status -> Varchar,
        pay_type -> Nullable<Varchar>,
        trade_no -> Nullable<Varchar>,
        amount -> Numeric,
        address -> Varchar,
        signer_name -> Varchar,
        signer_mobile -> Varchar,
        post -> Varchar,
        pay_time -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    order_lines (id) {
        id -> Int4,
        order_id -> Int4,
        product_id -> Int4,
        name -> Varchar,
        image -> Varchar,
        price -> Numeric,
        quantity -> Int4,
    }
}

diesel::table! {
    shopping_carts (id) {
        id -> Int4,
        user_id -> Int4,
        product_id -> Int4,
        quantity -> Int4,
        checked -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::joinable!(order_lines -> orders (order_id));

diesel::allow_tables_to_appear_in_same_query!(
    orders,
    order_lines,
    shopping_carts,
);
