diesel::table! {
    products (id) {
        id -> Int4,
        name -> Varchar,
        description -> Nullable<Text>,
        price -> Numeric,
        stock -> Int4,
        version -> Int8,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    holds (id) {
        id -> Uuid,
        product_id -> Int4,
        quantity -> Int4,
        status -> Varchar,
        expires_at -> Timestamptz,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    orders (id) {
        id -> Uuid,
        hold_id -> Uuid,
        product_id -> Int4,
        quantity -> Int4,
        unit_price -> Numeric,
        total_price -> Numeric,
        status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    payment_webhooks (id) {
        id -> Uuid,
        #[max_length = 255]
        idempotency_key -> Varchar,
        order_id -> Uuid,
        payment_status -> Varchar,
        processing_status -> Varchar,
        payload -> Nullable<Jsonb>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(products, holds, orders, payment_webhooks,);
